//! JSON payload encodings.
//!
//! Structured payloads cross the wire as JSON strings inside XML-RPC
//! strings, using tag-discriminated objects: `{"__Var": name}` for
//! variables, `{"__Subst": [[var, value], ...]}` for substitutions and
//! `{"__Claim": ...}` for claims. Symbols are plain JSON strings; quoted
//! string constants are `{"__Str": ...}`; compounds are
//! `{"__Term": [functor, [args]]}`; file references are
//! `{"file": path, "sha1": hex}`.

use super::WireError;
use crate::claims::{Claim, ClaimId, Evidence};
use crate::rules::RuleId;
use crate::term::{FileRef, Literal, Subst, Term};
use serde_json::{json, Value as Json};

pub fn term_to_json(term: &Term) -> Json {
    match term {
        Term::Var(name) => json!({ "__Var": name }),
        Term::Sym(s) => Json::String(s.clone()),
        Term::Str(s) => json!({ "__Str": s }),
        Term::Int(v) => json!(v),
        Term::Bool(b) => json!(b),
        Term::Compound(functor, args) => {
            json!({ "__Term": [functor, args.iter().map(term_to_json).collect::<Vec<_>>()] })
        }
        Term::List(items) => Json::Array(items.iter().map(term_to_json).collect()),
        Term::FileRef(fr) => json!({ "file": fr.file, "sha1": fr.sha1 }),
    }
}

pub fn term_from_json(value: &Json) -> Result<Term, WireError> {
    match value {
        Json::String(s) => Ok(Term::Sym(s.clone())),
        Json::Bool(b) => Ok(Term::Bool(*b)),
        Json::Number(n) => n
            .as_i64()
            .map(Term::Int)
            .ok_or_else(|| WireError::Payload(format!("non-integer number {n}"))),
        Json::Array(items) => Ok(Term::List(
            items.iter().map(term_from_json).collect::<Result<_, _>>()?,
        )),
        Json::Object(map) => {
            if let Some(Json::String(name)) = map.get("__Var") {
                return Ok(Term::Var(name.clone()));
            }
            if let Some(Json::String(s)) = map.get("__Str") {
                return Ok(Term::Str(s.clone()));
            }
            if let Some(spec) = map.get("__Term") {
                let parts = spec
                    .as_array()
                    .filter(|parts| parts.len() == 2)
                    .ok_or_else(|| WireError::Payload("__Term expects [functor, args]".into()))?;
                let functor = parts[0]
                    .as_str()
                    .ok_or_else(|| WireError::Payload("__Term functor must be a string".into()))?;
                let args = parts[1]
                    .as_array()
                    .ok_or_else(|| WireError::Payload("__Term args must be an array".into()))?
                    .iter()
                    .map(term_from_json)
                    .collect::<Result<_, _>>()?;
                return Ok(Term::Compound(functor.to_string(), args));
            }
            match (map.get("file"), map.get("sha1")) {
                (Some(Json::String(file)), Some(Json::String(sha1))) => {
                    Ok(Term::FileRef(FileRef {
                        file: file.clone(),
                        sha1: sha1.clone(),
                    }))
                }
                _ => Err(WireError::Payload(format!("unrecognised term object {value}"))),
            }
        }
        Json::Null => Err(WireError::Payload("null is not a term".into())),
    }
}

pub fn literal_to_json(lit: &Literal) -> Json {
    json!({ "pred": lit.pred, "args": lit.args.iter().map(term_to_json).collect::<Vec<_>>() })
}

pub fn literal_from_json(value: &Json) -> Result<Literal, WireError> {
    let pred = value
        .get("pred")
        .and_then(Json::as_str)
        .ok_or_else(|| WireError::Payload("literal missing pred".into()))?;
    let args = value
        .get("args")
        .and_then(Json::as_array)
        .ok_or_else(|| WireError::Payload("literal missing args".into()))?
        .iter()
        .map(term_from_json)
        .collect::<Result<_, _>>()?;
    Ok(Literal::new(pred, args))
}

pub fn subst_to_json(subst: &Subst) -> Json {
    let pairs: Vec<Json> = subst
        .iter()
        .map(|(var, term)| json!([var, term_to_json(term)]))
        .collect();
    json!({ "__Subst": pairs })
}

pub fn subst_from_json(value: &Json) -> Result<Subst, WireError> {
    let pairs = value
        .get("__Subst")
        .and_then(Json::as_array)
        .ok_or_else(|| WireError::Payload("expected __Subst object".into()))?;
    let mut subst = Subst::new();
    for pair in pairs {
        let entry = pair
            .as_array()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| WireError::Payload("__Subst entries are [var, value]".into()))?;
        let var = entry[0]
            .as_str()
            .ok_or_else(|| WireError::Payload("__Subst variable must be a string".into()))?;
        subst.bind(var.to_string(), term_from_json(&entry[1])?);
    }
    Ok(subst)
}

fn evidence_to_json(ev: &Evidence) -> Json {
    match ev {
        Evidence::Fact { rule } => json!({ "kind": "fact", "rule": rule.0 }),
        Evidence::Wrapper {
            name,
            args_digest,
            binding,
        } => json!({
            "kind": "wrapper",
            "name": name,
            "args_digest": args_digest,
            "binding": subst_to_json(binding),
        }),
        Evidence::RuleInstance { rule, support } => json!({
            "kind": "rule",
            "rule": rule.0,
            "support": support.iter().map(|c| c.0.clone()).collect::<Vec<_>>(),
        }),
        Evidence::Remote { peer, claim } => {
            json!({ "kind": "remote", "peer": peer, "claim": claim.0 })
        }
        Evidence::Error { source } => json!({ "kind": "error", "source": source }),
    }
}

fn evidence_from_json(value: &Json) -> Result<Evidence, WireError> {
    let kind = value
        .get("kind")
        .and_then(Json::as_str)
        .ok_or_else(|| WireError::Payload("evidence missing kind".into()))?;
    let field = |name: &str| -> Result<String, WireError> {
        value
            .get(name)
            .and_then(Json::as_str)
            .map(str::to_string)
            .ok_or_else(|| WireError::Payload(format!("evidence missing {name}")))
    };
    match kind {
        "fact" => Ok(Evidence::Fact {
            rule: RuleId(field("rule")?),
        }),
        "wrapper" => Ok(Evidence::Wrapper {
            name: field("name")?,
            args_digest: field("args_digest")?,
            binding: value
                .get("binding")
                .map(subst_from_json)
                .transpose()?
                .unwrap_or_default(),
        }),
        "rule" => {
            let support = value
                .get("support")
                .and_then(Json::as_array)
                .ok_or_else(|| WireError::Payload("rule evidence missing support".into()))?
                .iter()
                .map(|s| {
                    s.as_str()
                        .map(|s| ClaimId(s.to_string()))
                        .ok_or_else(|| WireError::Payload("support entries are claim ids".into()))
                })
                .collect::<Result<_, _>>()?;
            Ok(Evidence::RuleInstance {
                rule: RuleId(field("rule")?),
                support,
            })
        }
        "remote" => Ok(Evidence::Remote {
            peer: field("peer")?,
            claim: ClaimId(field("claim")?),
        }),
        "error" => Ok(Evidence::Error {
            source: field("source")?,
        }),
        other => Err(WireError::Payload(format!("unknown evidence kind {other:?}"))),
    }
}

pub fn claim_to_json(claim: &Claim) -> Json {
    json!({ "__Claim": {
        "id": claim.id.0,
        "literal": literal_to_json(&claim.literal),
        "evidence": claim.evidence.iter().map(evidence_to_json).collect::<Vec<_>>(),
    }})
}

pub fn claim_from_json(value: &Json) -> Result<Claim, WireError> {
    let body = value
        .get("__Claim")
        .ok_or_else(|| WireError::Payload("expected __Claim object".into()))?;
    let id = body
        .get("id")
        .and_then(Json::as_str)
        .ok_or_else(|| WireError::Payload("claim missing id".into()))?;
    let literal = literal_from_json(
        body.get("literal")
            .ok_or_else(|| WireError::Payload("claim missing literal".into()))?,
    )?;
    let evidence = body
        .get("evidence")
        .and_then(Json::as_array)
        .ok_or_else(|| WireError::Payload("claim missing evidence".into()))?
        .iter()
        .map(evidence_from_json)
        .collect::<Result<_, _>>()?;
    Ok(Claim {
        id: ClaimId(id.to_string()),
        literal,
        evidence,
    })
}

/// Encode a list of substitutions as the JSON string carried in an
/// XML-RPC string.
pub fn answers_to_string(substs: &[Subst]) -> String {
    Json::Array(substs.iter().map(subst_to_json).collect()).to_string()
}

pub fn answers_from_string(text: &str) -> Result<Vec<Subst>, WireError> {
    let value: Json = serde_json::from_str(text)?;
    value
        .as_array()
        .ok_or_else(|| WireError::Payload("expected an array of substitutions".into()))?
        .iter()
        .map(subst_from_json)
        .collect()
}

/// Encode a list of claims as the JSON string carried in an XML-RPC
/// string.
pub fn claims_to_string(claims: &[Claim]) -> String {
    Json::Array(claims.iter().map(claim_to_json).collect()).to_string()
}

pub fn claims_from_string(text: &str) -> Result<Vec<Claim>, WireError> {
    let value: Json = serde_json::from_str(text)?;
    value
        .as_array()
        .ok_or_else(|| WireError::Payload("expected an array of claims".into()))?
        .iter()
        .map(claim_from_json)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::parse_literal;

    #[test]
    fn test_term_round_trip_preserves_kinds() {
        let lit = parse_literal(
            r#"p(X, foo, "quoted", 42, true, [1, g(Y)], fileref("a.txt", "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"))"#,
        )
        .unwrap();
        for term in &lit.args {
            let back = term_from_json(&term_to_json(term)).unwrap();
            assert_eq!(&back, term);
        }
    }

    #[test]
    fn test_var_encoding_is_tagged() {
        let v = term_to_json(&Term::Var("X".into()));
        assert_eq!(v, serde_json::json!({ "__Var": "X" }));
        // Symbols and quoted strings stay distinct on the wire.
        assert_ne!(
            term_to_json(&Term::Sym("a".into())),
            term_to_json(&Term::Str("a".into()))
        );
    }

    #[test]
    fn test_subst_round_trip_preserves_names_and_values() {
        let mut s = Subst::new();
        s.bind("X", Term::Int(1));
        s.bind("Y", Term::Sym("mary".into()));
        s.bind("Z", Term::List(vec![Term::Bool(false)]));
        let text = answers_to_string(&[s.clone()]);
        let back = answers_from_string(&text).unwrap();
        assert_eq!(back, vec![s]);
    }

    #[test]
    fn test_claim_round_trip() {
        let claim = Claim {
            id: ClaimId::of(&parse_literal("ancestor(bill, mary)").unwrap()),
            literal: parse_literal("ancestor(bill, mary)").unwrap(),
            evidence: vec![
                Evidence::Fact {
                    rule: RuleId("abc".into()),
                },
                Evidence::RuleInstance {
                    rule: RuleId("def".into()),
                    support: vec![ClaimId("123".into())],
                },
                Evidence::Remote {
                    peer: "node-1".into(),
                    claim: ClaimId("456".into()),
                },
            ],
        };
        let text = claims_to_string(&[claim.clone()]);
        let back = claims_from_string(&text).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].literal, claim.literal);
        assert_eq!(back[0].evidence, claim.evidence);
    }

    #[test]
    fn test_malformed_payload_rejected() {
        assert!(answers_from_string("{}").is_err());
        assert!(answers_from_string("not json").is_err());
        assert!(term_from_json(&serde_json::json!({ "weird": 1 })).is_err());
    }
}
