//! The external decompiler seam.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct DecompilationMetadata {
    pub max_threads: usize,
    /// Extra classpath for resolving types referenced by the input.
    pub libraries: Vec<PathBuf>,
    pub options: BTreeMap<String, String>,
}

pub trait Decompiler {
    /// Identifies the decompiler and its version in cache keys.
    fn name(&self) -> String;

    /// Decompiles every class in `input` into `.java` entries of `output_jar`. A line map
    /// is written to `line_map` when the decompiler produces one. Progress lines go to `log`.
    fn decompile(
        &self,
        input: &Path,
        output_jar: &Path,
        line_map: &Path,
        metadata: &DecompilationMetadata,
        log: &mut dyn FnMut(&str),
    ) -> Result<()>;
}
