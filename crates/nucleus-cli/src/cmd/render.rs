use crate::cmd::read_event;
use crate::output::print_json;
use anyhow::Context;
use nucleus_core::lifecycle::LifecycleAdapter;
use nucleus_core::script::{ScriptBuilder, ScriptParams, TemplateScriptBuilder};
use std::collections::BTreeMap;
use std::path::Path;

/// Render with placeholder credentials. Placeholders are registered as
/// sensitive, so they print redacted just like real passwords would.
pub fn run(event_path: &Path, json: bool) -> anyhow::Result<()> {
    let event = read_event(event_path)?;
    let request = LifecycleAdapter::request_for(&event)?
        .context("delete events dispatch nothing, so there is no script to render")?;

    let credentials: BTreeMap<String, String> = request
        .secrets
        .iter()
        .map(|s| (s.binding.clone(), format!("<{}>", s.binding)))
        .collect();
    let params = ScriptParams::from_request(&request, credentials);
    let script = TemplateScriptBuilder
        .build(&params)
        .context("failed to render script")?;
    let lines = script.redacted_lines();

    if json {
        let secrets: Vec<_> = request
            .secrets
            .iter()
            .map(|s| serde_json::json!({ "secret_id": s.secret_id, "binding": s.binding }))
            .collect();
        print_json(&serde_json::json!({
            "template": request.template,
            "selector": request.selector,
            "secrets": secrets,
            "lines": lines,
        }))?;
        return Ok(());
    }

    println!("# template: {}", request.template);
    println!("# targets:  {}", request.selector);
    for line in &lines {
        println!("{line}");
    }
    Ok(())
}
