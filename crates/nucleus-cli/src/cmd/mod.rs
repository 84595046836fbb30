pub mod config;
pub mod handle;
pub mod render;

use anyhow::Context;
use nucleus_core::lifecycle::LifecycleEvent;
use std::io::Read;
use std::path::Path;

/// Read a lifecycle event from a file, or from stdin when the path is `-`.
pub fn read_event(path: &Path) -> anyhow::Result<LifecycleEvent> {
    let data = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read event from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read event {}", path.display()))?
    };
    Ok(LifecycleEvent::from_json(&data)?)
}
