//! Splits a client jar and a server jar into a common jar and a client-only jar.

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::Result;
use crate::jar::{copy_entries, list_regular_entries};

pub const COMMON_ENV: &str = "common";
pub const CLIENT_ENV: &str = "client";

/// Entry sets computed from the two inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntrySplit {
    pub common: BTreeSet<String>,
    pub client_only: BTreeSet<String>,
    pub server_only: BTreeSet<String>,
}

impl EntrySplit {
    pub fn compute(
        client: &BTreeSet<String>,
        server: &BTreeSet<String>,
        shared: &BTreeSet<String>,
        forced_client: &BTreeSet<String>,
    ) -> Self {
        let common = client
            .intersection(server)
            .chain(shared)
            .filter(|entry| !forced_client.contains(*entry))
            .cloned()
            .collect();

        let client_only = client
            .difference(server)
            .chain(shared)
            .chain(forced_client)
            .cloned()
            .collect();

        let server_only = server.difference(client).cloned().collect();

        Self {
            common,
            client_only,
            server_only,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SplitReport {
    pub common_jar: String,
    pub client_only_jar: String,
    pub common_entries: usize,
    pub client_only_entries: usize,
    /// Server entries missing from the client. These are not written anywhere.
    pub server_only_entries: Vec<String>,
}

pub struct JarSplitter {
    client_jar: PathBuf,
    server_jar: PathBuf,
    shared: BTreeSet<String>,
    forced_client: BTreeSet<String>,
}

impl JarSplitter {
    pub fn new(client_jar: impl Into<PathBuf>, server_jar: impl Into<PathBuf>) -> Self {
        Self {
            client_jar: client_jar.into(),
            server_jar: server_jar.into(),
            shared: BTreeSet::new(),
            forced_client: BTreeSet::new(),
        }
    }

    /// Entry that goes to both outputs.
    pub fn shared_entry(&mut self, path: impl Into<String>) -> &mut Self {
        self.shared.insert(path.into());
        self
    }

    /// Entry that only goes to the client output, even when the server has it.
    pub fn forced_client_entry(&mut self, path: impl Into<String>) -> &mut Self {
        self.forced_client.insert(path.into());
        self
    }

    /// Expects every server entry to also exist in the client jar; server-only entries are
    /// reported and left out. A shared entry missing from either jar fails the split.
    pub fn split(&self, client_only_output: &Path, common_output: &Path) -> Result<SplitReport> {
        let client = list_regular_entries(&self.client_jar)?;
        let server = list_regular_entries(&self.server_jar)?;
        let split = EntrySplit::compute(&client, &server, &self.shared, &self.forced_client);

        if !split.server_only.is_empty() {
            warn!(
                count = split.server_only.len(),
                server_jar = %self.server_jar.display(),
                "server jar has entries missing from the client jar, they are not split out"
            );
        }

        let common_entries =
            copy_entries(&split.common, &self.server_jar, common_output, Some(COMMON_ENV))?;
        let client_only_entries = copy_entries(
            &split.client_only,
            &self.client_jar,
            client_only_output,
            Some(CLIENT_ENV),
        )?;
        info!(
            common = common_entries,
            client_only = client_only_entries,
            "split jars"
        );

        Ok(SplitReport {
            common_jar: common_output.to_string_lossy().to_string(),
            client_only_jar: client_only_output.to_string_lossy().to_string(),
            common_entries,
            client_only_entries,
            server_only_entries: split.server_only.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::jar::test_support::{temp_path, write_jar};
    use crate::jar::{Jar, MANIFEST_PATH};

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn set_arithmetic() {
        let split = EntrySplit::compute(
            &set(&["a", "b", "c", "shared"]),
            &set(&["b", "c", "s"]),
            &set(&["shared"]),
            &set(&["c"]),
        );
        assert_eq!(split.common, set(&["b", "shared"]));
        assert_eq!(split.client_only, set(&["a", "c", "shared"]));
        assert_eq!(split.server_only, set(&["s"]));
    }

    #[test]
    fn split_writes_labelled_jars() -> Result<()> {
        let client = temp_path("split_client.jar");
        let server = temp_path("split_server.jar");
        let common_out = temp_path("split_common_out.jar");
        let client_out = temp_path("split_client_out.jar");
        write_jar(
            &client,
            &[("p/Common.class", b"client copy"), ("p/ClientOnly.class", b"c")],
        )?;
        write_jar(&server, &[("p/Common.class", b"server copy")])?;

        let report = JarSplitter::new(&client, &server).split(&client_out, &common_out)?;
        assert_eq!(report.common_entries, 1);
        assert_eq!(report.client_only_entries, 1);
        assert!(report.server_only_entries.is_empty());

        let mut common = Jar::open(&common_out)?;
        assert_eq!(common.read("p/Common.class")?, b"server copy");
        assert!(common.read_to_string(MANIFEST_PATH)?.contains("Split-Environment-Name: common"));

        let mut client_only = Jar::open(&client_out)?;
        assert!(client_only.contains("p/ClientOnly.class"));
        assert!(!client_only.contains("p/Common.class"));
        assert!(
            client_only
                .read_to_string(MANIFEST_PATH)?
                .contains("Split-Environment-Name: client")
        );

        for path in [client, server, common_out, client_out] {
            std::fs::remove_file(path).unwrap();
        }
        Ok(())
    }

    #[test]
    fn shared_entry_missing_from_server_fails() -> Result<()> {
        let client = temp_path("split_shared_client.jar");
        let server = temp_path("split_shared_server.jar");
        let common_out = temp_path("split_shared_common_out.jar");
        let client_out = temp_path("split_shared_client_out.jar");
        write_jar(
            &client,
            &[("p/Common.class", b"c"), ("data/shared.txt", b"client only")],
        )?;
        write_jar(&server, &[("p/Common.class", b"s")])?;

        let mut splitter = JarSplitter::new(&client, &server);
        splitter.shared_entry("data/shared.txt");
        let err = splitter.split(&client_out, &common_out).unwrap_err();
        match err {
            CacheError::Io { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
                assert!(source.to_string().contains("data/shared.txt"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!common_out.exists());

        for path in [client, server] {
            std::fs::remove_file(path).unwrap();
        }
        Ok(())
    }
}
