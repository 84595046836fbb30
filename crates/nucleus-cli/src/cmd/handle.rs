use crate::cmd::read_event;
use crate::output::{print_json, print_table};
use nucleus_core::config::Settings;
use nucleus_core::error::ErrorKind;
use nucleus_core::lifecycle::{LifecycleAdapter, LifecycleOutcome, LifecycleResponse};
use nucleus_core::types::ExecutionStatus;
use std::path::Path;

pub fn run(settings: &Settings, event_path: &Path, json: bool) -> anyhow::Result<()> {
    let event = read_event(event_path)?;

    let rt = tokio::runtime::Runtime::new()?;
    let (response, outcome) = rt.block_on(async {
        let orchestrator = match nucleus_aws::orchestrator(settings, event.region()) {
            Ok(o) => o,
            Err(e) => {
                tracing::error!(error = %e, "aws backends unavailable");
                return (
                    LifecycleResponse::failed_with(&event, ErrorKind::Internal, e.to_string()),
                    None,
                );
            }
        };
        let adapter = LifecycleAdapter::new(orchestrator);
        match adapter.handle(&event).await {
            Ok(outcome) => (LifecycleResponse::from_outcome(&event, &outcome), Some(outcome)),
            Err(e) => (LifecycleResponse::failure(&event, &e), None),
        }
    });

    if json {
        print_json(&response)?;
    } else {
        print_outcome(&response, outcome.as_ref());
    }

    if !response.is_success() {
        anyhow::bail!("{} failed: {}", event.request_type, response.reason);
    }
    Ok(())
}

fn print_outcome(response: &LifecycleResponse, outcome: Option<&LifecycleOutcome>) {
    println!("{:?}: {}", response.status, response.reason);
    let Some(aggregate) = outcome.and_then(|o| o.aggregate.as_ref()) else {
        return;
    };
    if aggregate.is_empty() {
        return;
    }
    let rows = aggregate
        .results
        .iter()
        .map(|r| {
            let status = match r.status {
                ExecutionStatus::Succeeded => "succeeded",
                ExecutionStatus::Failed => "failed",
                ExecutionStatus::NotAttempted => "not attempted",
            };
            let post = r
                .post_action
                .as_ref()
                .map(|p| {
                    if p.succeeded {
                        p.action.to_string()
                    } else {
                        format!("{} (failed)", p.action)
                    }
                })
                .unwrap_or_else(|| "-".to_string());
            vec![
                r.instance_id.to_string(),
                status.to_string(),
                post,
                r.error.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["INSTANCE", "STATUS", "POST-ACTION", "ERROR"], rows);
}
