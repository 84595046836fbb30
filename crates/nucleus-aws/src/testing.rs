//! A stand-in `aws` executable for tests.
//!
//! The fake is a `/bin/sh` script whose body is supplied by the test. It gets
//! `FAKE_AWS_DIR` pointing at its own temp directory so it can record
//! arguments or keep counters between calls.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use tempfile::TempDir;

use crate::process::AwsCli;

pub(crate) struct FakeAws {
    dir: TempDir,
    bin: PathBuf,
}

impl FakeAws {
    pub(crate) fn new(body: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("aws");
        let script = format!(
            "#!/bin/sh\nFAKE_AWS_DIR='{}'\nexport FAKE_AWS_DIR\n{body}\n",
            dir.path().display()
        );
        std::fs::write(&bin, script).unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir, bin }
    }

    pub(crate) fn cli(&self) -> AwsCli {
        AwsCli::new(&self.bin)
    }

    pub(crate) fn write(&self, name: &str, contents: &str) {
        std::fs::write(self.dir.path().join(name), contents).unwrap();
    }

    /// Contents of a file the script wrote into `FAKE_AWS_DIR` (empty if absent).
    pub(crate) fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(name))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }
}
