use std::collections::BTreeSet;
use std::path::Path;
use std::process;

use sieve_interchange::{Entitlement, PolicyDocument};

use crate::{loader, report_error, OutputFormat};

pub(crate) fn cmd_check(path: &Path, output: OutputFormat, quiet: bool) {
    let files = match loader::load(path) {
        Ok(files) => files,
        Err(msg) => {
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    };
    if files.is_empty() {
        report_error(
            &format!("error: no policy documents found in '{}'", path.display()),
            output,
            quiet,
        );
        process::exit(1);
    }

    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    for doc in files.iter().filter_map(|f| f.documents.as_ref().ok()).flatten() {
        if !seen.insert(doc.name().to_string()) {
            duplicates.insert(doc.name().to_string());
        }
    }
    let failed = files.iter().any(|f| f.documents.is_err()) || !duplicates.is_empty();

    match output {
        OutputFormat::Json => {
            let reports: Vec<serde_json::Value> = files
                .iter()
                .map(|f| match &f.documents {
                    Ok(docs) => serde_json::json!({
                        "path": f.path.display().to_string(),
                        "valid": true,
                        "documents": docs.iter().map(summary).collect::<Vec<_>>(),
                    }),
                    Err(e) => serde_json::json!({
                        "path": f.path.display().to_string(),
                        "valid": false,
                        "error": e,
                    }),
                })
                .collect();
            let json = serde_json::json!({
                "valid": !failed,
                "files": reports,
                "duplicate_names": duplicates,
            });
            let rendered = serde_json::to_string_pretty(&json).unwrap_or_default();
            if failed {
                eprintln!("{}", rendered);
            } else {
                println!("{}", rendered);
            }
        }
        OutputFormat::Text => {
            for f in &files {
                match &f.documents {
                    Ok(docs) => {
                        if !quiet {
                            for doc in docs {
                                println!("{}: {}", f.path.display(), describe(doc));
                            }
                        }
                    }
                    Err(e) => eprintln!("invalid: {}", e),
                }
            }
            for name in &duplicates {
                eprintln!("duplicate document name '{}'", name);
            }
            if !failed && !quiet {
                println!("valid ({} document(s))", seen.len());
            }
        }
    }

    if failed {
        process::exit(1);
    }
}

fn entitlement(e: Entitlement) -> &'static str {
    match e {
        Entitlement::Permit => "permit",
        Entitlement::Deny => "deny",
    }
}

fn describe(doc: &PolicyDocument) -> String {
    match doc {
        PolicyDocument::Policy(p) => format!("policy '{}' ({})", p.name, entitlement(p.entitlement)),
        PolicyDocument::PolicySet(s) => format!(
            "policy set '{}' ({}, {} policies)",
            s.name,
            s.algorithm,
            s.policies.len()
        ),
    }
}

fn summary(doc: &PolicyDocument) -> serde_json::Value {
    match doc {
        PolicyDocument::Policy(p) => serde_json::json!({
            "kind": "policy",
            "name": p.name,
            "entitlement": entitlement(p.entitlement),
        }),
        PolicyDocument::PolicySet(s) => serde_json::json!({
            "kind": "policy_set",
            "name": s.name,
            "algorithm": s.algorithm.to_string(),
            "policies": s.policies.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
        }),
    }
}
