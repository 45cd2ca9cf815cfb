use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use sieve_eval::{
    AuthorizationDecision, AuthorizationSubscription, ClockAttributeFinder,
    EmbeddedPolicyDecisionPoint, FunctionRegistry, PdpConfiguration, PolicyDecisionPoint,
    StaticPolicyRetrievalPoint,
};
use tracing::debug;

use crate::{loader, report_error, OutputFormat};

pub(crate) fn cmd_decide(
    policies: &Path,
    subscription_path: &Path,
    config_path: Option<&Path>,
    timeout_ms: u64,
    output: OutputFormat,
    quiet: bool,
) {
    let documents = match loader::load_all(policies) {
        Ok(documents) => documents,
        Err(msg) => {
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    };

    let subscription = match read_subscription(subscription_path) {
        Ok(subscription) => subscription,
        Err(msg) => {
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    };

    // A policy directory may carry its own pdp.json.
    let config_source = config_path.or_else(|| policies.is_dir().then_some(policies));
    let config = match config_source.map(PdpConfiguration::load).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            report_error(&format!("error: {}", e), output, quiet);
            process::exit(1);
        }
    };
    debug!(documents = documents.len(), algorithm = %config.algorithm, "deciding");

    let pdp = EmbeddedPolicyDecisionPoint::builder()
        .retrieval(Arc::new(StaticPolicyRetrievalPoint::new(documents)))
        .config(config)
        .functions(FunctionRegistry::standard())
        .attribute_finder(ClockAttributeFinder::NAME, Arc::new(ClockAttributeFinder))
        .build();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            report_error(&format!("error: failed to start runtime: {}", e), output, quiet);
            process::exit(1);
        }
    };
    let decided = runtime.block_on(async {
        tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            pdp.decide_once(subscription),
        )
        .await
    });
    let decision = match decided {
        Ok(decision) => decision,
        Err(_) => {
            report_error(
                &format!("error: no decision within {} ms", timeout_ms),
                output,
                quiet,
            );
            process::exit(1);
        }
    };

    print_decision(&decision, output, quiet);
}

fn read_subscription(path: &Path) -> Result<AuthorizationSubscription, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("error reading file '{}': {}", path.display(), e))?;
    serde_json::from_str(&text)
        .map_err(|e| format!("error: invalid subscription in '{}': {}", path.display(), e))
}

fn print_decision(decision: &AuthorizationDecision, output: OutputFormat, quiet: bool) {
    match output {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(decision)
                    .unwrap_or_else(|e| format!("serialization error: {}", e))
            );
        }
        OutputFormat::Text => {
            println!("{}", decision.decision);
            if quiet {
                return;
            }
            if let Some(resource) = &decision.resource {
                println!("resource: {}", resource);
            }
            for obligation in &decision.obligations {
                println!("obligation: {}", obligation);
            }
            for advice in &decision.advice {
                println!("advice: {}", advice);
            }
        }
    }
}
