//! ETB Shell
//!
//! Interactive client for a running node. Every command is available as
//! `name = command ...`, which stores the result under `name` for later
//! interpolation with `$name`.
//!
//! ```bash
//! etb-shell --host 127.0.0.1 --port 26532
//! etb-shell --batch session.etbsh
//! etb-shell session.etbsh            # run script, then open the REPL
//! ```
//!
//! ## Commands
//!
//! - `query <goal>` - admit a query, returns its id
//! - `wait <id>` / `done <id>` - completion
//! - `info <id>` - root goal, goal state, creation time, origin
//! - `answers <id>` / `claims <id>` / `errors <id>` - results
//! - `close <id>` - cancel a query
//! - `put <local-path> <dest-path>` - upload a file, returns its reference
//! - `get <ref> <local-path>` - download a reference
//! - `ls [dir]` - workspace classification
//! - `connect <host> <port>` / `tunnel <local> <remote>`
//! - `offers <pred/arity>`
//! - `active` / `completed` / `allclaims`
//! - `vars`, `help`, `quit`

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use etb::rpc::PeerClient;
use etb::term::Term;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "etb-shell", version, about = "Evidential tool bus shell")]
struct Args {
    /// Node address.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Node port.
    #[arg(long, default_value_t = 26532)]
    port: u16,

    /// Execute a script and exit.
    #[arg(long)]
    batch: Option<PathBuf>,

    /// Script to execute before opening the REPL.
    script: Option<PathBuf>,
}

struct Shell {
    client: PeerClient,
    bindings: HashMap<String, String>,
}

impl Shell {
    fn new(client: PeerClient) -> Self {
        Shell {
            client,
            bindings: HashMap::new(),
        }
    }

    /// Replace `$name` tokens with stored bindings.
    fn interpolate(&self, input: &str) -> Result<String> {
        let mut out = String::with_capacity(input.len());
        let mut chars = input.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            let mut name = String::new();
            while let Some(&n) = chars.peek() {
                if n.is_alphanumeric() || n == '_' {
                    name.push(n);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = self
                .bindings
                .get(&name)
                .ok_or_else(|| anyhow!("unbound variable ${name}"))?;
            out.push_str(value);
        }
        Ok(out)
    }

    /// Run one line. Returns false when the shell should exit.
    async fn execute(&mut self, line: &str) -> Result<bool> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(true);
        }

        // `name = command ...` stores the command's result.
        let (binding, command) = match line.split_once('=') {
            Some((name, rest))
                if !name.trim().is_empty()
                    && name.trim().chars().all(|c| c.is_alphanumeric() || c == '_') =>
            {
                (Some(name.trim().to_string()), rest.trim())
            }
            _ => (None, line),
        };

        let command = self.interpolate(command)?;
        let (word, rest) = match command.split_once(char::is_whitespace) {
            Some((w, r)) => (w, r.trim()),
            None => (command.as_str(), ""),
        };

        let result = match word {
            "quit" | "exit" => return Ok(false),
            "help" => {
                print_help();
                None
            }
            "vars" => {
                for (name, value) in &self.bindings {
                    println!("{name} = {value}");
                }
                None
            }
            "query" => {
                if rest.is_empty() {
                    bail!("usage: query <goal>");
                }
                let id = self.client.query(rest).await?;
                println!("{id}");
                Some(id)
            }
            "wait" => {
                self.client.query_wait(rest).await?;
                println!("completed");
                None
            }
            "done" => {
                let done = self.client.query_done(rest).await?;
                println!("{done}");
                Some(done.to_string())
            }
            "info" => {
                let info = self.client.query_info(rest).await?;
                println!("{info:#}");
                None
            }
            "answers" => {
                let answers = self.client.query_answers(rest).await?;
                if answers.is_empty() {
                    println!("(no answers)");
                }
                for answer in &answers {
                    println!("{answer}");
                }
                None
            }
            "claims" => {
                for claim in self.client.query_claims(rest).await? {
                    println!("{}  {}", claim.id, claim.literal);
                }
                None
            }
            "errors" => {
                let errors = self.client.query_errors(rest).await?;
                if errors.is_empty() {
                    println!("(no errors)");
                }
                for claim in errors {
                    println!("{}", claim.literal);
                }
                None
            }
            "close" => {
                self.client.query_close(rest).await?;
                None
            }
            "put" => {
                let (local, dest) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| anyhow!("usage: put <local-path> <dest-path>"))?;
                let bytes = std::fs::read(local.trim())
                    .with_context(|| format!("reading {}", local.trim()))?;
                let fr = self.client.put_file(&bytes, dest.trim()).await?;
                let encoded =
                    etb::rpc::wire::term_to_json(&Term::FileRef(fr.clone())).to_string();
                println!("{fr}");
                Some(encoded)
            }
            "get" => {
                let (ref_text, local) = rest
                    .rsplit_once(char::is_whitespace)
                    .ok_or_else(|| anyhow!("usage: get <ref> <local-path>"))?;
                let json: serde_json::Value = serde_json::from_str(ref_text.trim())
                    .context("the reference must be the JSON printed by put")?;
                let Term::FileRef(fr) = etb::rpc::wire::term_from_json(&json)? else {
                    bail!("not a file reference: {ref_text}");
                };
                let bytes = self.client.get_file(&fr).await?;
                std::fs::write(local.trim(), &bytes)
                    .with_context(|| format!("writing {}", local.trim()))?;
                println!("{} bytes -> {}", bytes.len(), local.trim());
                None
            }
            "ls" => {
                let report = self.client.ls(rest).await?;
                for dir in &report.dirs {
                    println!("{dir}/");
                }
                for file in &report.in_sync {
                    println!("{file}  (in sync)");
                }
                for file in &report.outdated {
                    println!("{file}  (outdated)");
                }
                for file in &report.untracked {
                    println!("{file}  (untracked)");
                }
                None
            }
            "connect" => {
                let (host, port) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| anyhow!("usage: connect <host> <port>"))?;
                self.client
                    .connect(host.trim(), port.trim().parse()?)
                    .await?;
                println!("connected");
                None
            }
            "tunnel" => {
                let (local, remote) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| anyhow!("usage: tunnel <local-port> <remote-port>"))?;
                self.client
                    .tunnel(local.trim().parse()?, remote.trim().parse()?)
                    .await?;
                println!("tunnel installed");
                None
            }
            "offers" => {
                let offered = self.client.offers(rest).await?;
                println!("{offered}");
                Some(offered.to_string())
            }
            "active" => {
                for id in self.client.active_queries().await? {
                    println!("{id}");
                }
                None
            }
            "completed" => {
                for id in self.client.done_queries().await? {
                    println!("{id}");
                }
                None
            }
            "allclaims" => {
                for claim in self.client.get_all_claims().await? {
                    println!("{}  {}", claim.id, claim.literal);
                }
                None
            }
            other => bail!("unknown command {other:?} (try help)"),
        };

        if let (Some(name), Some(value)) = (binding, result) {
            self.bindings.insert(name, value);
        }
        Ok(true)
    }

    async fn run_script(&mut self, path: &PathBuf) -> Result<()> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        for (number, line) in text.lines().enumerate() {
            if !self
                .execute(line)
                .await
                .with_context(|| format!("{}:{}", path.display(), number + 1))?
            {
                break;
            }
        }
        Ok(())
    }
}

fn print_help() {
    println!("commands:");
    println!("  query <goal>             admit a query");
    println!("  wait | done | close <id> completion and cancellation");
    println!("  info <id>                query metadata");
    println!("  answers | claims | errors <id>");
    println!("  put <local> <dest>       upload a file");
    println!("  get <ref> <local>        download a reference");
    println!("  ls [dir]                 workspace classification");
    println!("  connect <host> <port>    join a fabric");
    println!("  tunnel <local> <remote>  install a tunnel rewrite");
    println!("  offers <pred/arity>      capability probe");
    println!("  active | completed | allclaims");
    println!("  name = <command>         bind a result, use as $name");
    println!("  vars | help | quit");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut shell = Shell::new(PeerClient::new(&args.host, args.port));

    if let Some(script) = &args.batch {
        return shell.run_script(script).await;
    }
    if let Some(script) = &args.script {
        shell.run_script(script).await?;
    }

    println!("etb-shell connected to {}:{} (help for commands)", args.host, args.port);
    let mut editor = DefaultEditor::new()?;
    loop {
        match editor.readline("etb> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                match shell.execute(&line).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("error: {e:#}"),
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                println!("readline error: {e}");
                break;
            }
        }
    }
    Ok(())
}
