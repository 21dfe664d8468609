use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::decompiler::{DecompilationMetadata, Decompiler};
use crate::error::{CacheError, IoResultExt, Result};
use crate::jar::JarBuilder;

fn java_command(java_bin: &str, args: &[String]) -> Result<std::process::Output> {
    let spawn_failed = |e: std::io::Error| {
        CacheError::Decompiler(format!(
            "failed to execute {java_bin} (ensure JRE/JDK is installed): {e}"
        ))
    };

    #[cfg(windows)]
    {
        let lower = java_bin.to_ascii_lowercase();
        if lower.ends_with(".cmd") || lower.ends_with(".bat") {
            return Command::new("cmd")
                .arg("/C")
                .arg(java_bin)
                .args(args)
                .output()
                .map_err(spawn_failed);
        }
    }

    Command::new(java_bin)
        .args(args)
        .output()
        .map_err(spawn_failed)
}

fn path_arg(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| CacheError::invalid(format!("path is not valid UTF-8: {}", path.display())))
}

#[derive(Debug, Clone)]
pub struct Cfr {
    cfr_jar: PathBuf,
    java_bin: String,
}

impl Cfr {
    /// Uses `DECOMP_CACHE_JAVA` as the java executable when set, `java` otherwise.
    pub fn new(cfr_jar: PathBuf) -> Self {
        let java_bin = std::env::var("DECOMP_CACHE_JAVA").unwrap_or_else(|_| "java".to_string());
        Self { cfr_jar, java_bin }
    }

    pub fn with_java_bin(mut self, java_bin: impl Into<String>) -> Self {
        self.java_bin = java_bin.into();
        self
    }

    fn args(&self, input: &Path, output_dir: &Path, metadata: &DecompilationMetadata) -> Result<Vec<String>> {
        let mut args = vec![
            "-jar".to_string(),
            path_arg(&self.cfr_jar)?,
            path_arg(input)?,
            "--outputdir".to_string(),
            path_arg(output_dir)?,
            "--silent".to_string(),
            "true".to_string(),
            "--comments".to_string(),
            "false".to_string(),
        ];

        if !metadata.libraries.is_empty() {
            let joined = std::env::join_paths(&metadata.libraries)
                .map_err(|e| CacheError::invalid(format!("invalid library path: {e}")))?;
            args.push("--extraclasspath".to_string());
            args.push(path_arg(Path::new(&joined))?);
        }

        for (key, value) in &metadata.options {
            args.push(format!("--{key}"));
            args.push(value.clone());
        }
        Ok(args)
    }
}

impl Decompiler for Cfr {
    fn name(&self) -> String {
        let file = self
            .cfr_jar
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "cfr.jar".to_string());
        format!("cfr:{file}")
    }

    /// CFR writes no line map, so `line_map` is left untouched.
    fn decompile(
        &self,
        input: &Path,
        output_jar: &Path,
        _line_map: &Path,
        metadata: &DecompilationMetadata,
        log: &mut dyn FnMut(&str),
    ) -> Result<()> {
        let work = tempfile::Builder::new()
            .prefix("decomp-cache-cfr")
            .tempdir()
            .at_path(std::env::temp_dir())?;
        debug!(
            input = %input.display(),
            threads = metadata.max_threads,
            "running CFR"
        );

        let output = java_command(&self.java_bin, &self.args(input, work.path(), metadata)?)?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            log(line);
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CacheError::Decompiler(format!(
                "CFR decompilation failed: {}",
                stderr.trim()
            )));
        }

        pack_sources(work.path(), output_jar)
    }
}

/// Packs every `.java` file under `dir` into a new jar, keyed by its relative path.
fn pack_sources(dir: &Path, output_jar: &Path) -> Result<()> {
    let mut sources = Vec::new();
    for entry in WalkBuilder::new(dir).standard_filters(false).build() {
        let Ok(entry) = entry else {
            continue;
        };
        let path = entry.path();
        if !entry.file_type().is_some_and(|t| t.is_file())
            || path.extension().is_none_or(|e| e != "java")
        {
            continue;
        }
        if let Ok(relative) = path.strip_prefix(dir) {
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            sources.push((name, path.to_path_buf()));
        }
    }
    sources.sort();

    let mut jar = JarBuilder::create(output_jar)?;
    for (name, path) in sources {
        let bytes = std::fs::read(&path).at_path(&path)?;
        jar.write(&name, &bytes)?;
    }
    jar.finish()?;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::jar::Jar;
    use crate::jar::test_support::temp_path;
    use std::fs;

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }

    #[test]
    fn decompile_packs_output_dir_into_jar() -> Result<()> {
        let base = temp_path("cfr_pack");
        let fake_cfr = base.join("cfr.jar");
        let input = base.join("in.jar");
        let output = base.join("out.jar");
        let fake_java = base.join("bin").join("java");

        write_file(&fake_cfr, "stub");
        write_file(&input, "stub");
        write_file(
            &fake_java,
            r#"#!/bin/sh
set -e
if [ "$4" != "--outputdir" ]; then
  echo "unexpected args" >&2
  exit 1
fi
mkdir -p "$5/org/example"
echo "package org.example; public class Demo {}" > "$5/org/example/Demo.java"
echo "summary" > "$5/summary.txt"
echo "Processing org.example.Demo"
"#,
        );
        make_executable(&fake_java);

        let cfr = Cfr::new(fake_cfr).with_java_bin(fake_java.to_string_lossy());
        let mut lines = Vec::new();
        cfr.decompile(
            &input,
            &output,
            &base.join("out.linemap"),
            &DecompilationMetadata::default(),
            &mut |line| lines.push(line.to_string()),
        )?;

        assert_eq!(lines, vec!["Processing org.example.Demo"]);
        let mut jar = Jar::open(&output)?;
        assert_eq!(jar.entries().collect::<Vec<_>>(), vec!["org/example/Demo.java"]);
        assert!(jar.read_to_string("org/example/Demo.java")?.contains("public class Demo"));

        let _ = fs::remove_dir_all(base);
        Ok(())
    }

    #[test]
    fn decompile_reports_stderr_on_failure() {
        let base = temp_path("cfr_fail");
        let fake_cfr = base.join("cfr.jar");
        let fake_java = base.join("bin").join("java");
        write_file(&fake_cfr, "stub");
        write_file(
            &fake_java,
            r#"#!/bin/sh
echo "boom from fake cfr" >&2
exit 1
"#,
        );
        make_executable(&fake_java);

        let cfr = Cfr::new(fake_cfr).with_java_bin(fake_java.to_string_lossy());
        let err = cfr
            .decompile(
                &base.join("in.jar"),
                &base.join("out.jar"),
                &base.join("out.linemap"),
                &DecompilationMetadata::default(),
                &mut |_| {},
            )
            .unwrap_err()
            .to_string();
        assert!(err.contains("CFR decompilation failed"));
        assert!(err.contains("boom from fake cfr"));
        assert!(!base.join("out.jar").exists());

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn options_and_libraries_become_arguments() -> Result<()> {
        let cfr = Cfr::new(PathBuf::from("/tools/cfr.jar")).with_java_bin("java");
        let metadata = DecompilationMetadata {
            max_threads: 2,
            libraries: vec![PathBuf::from("/libs/a.jar"), PathBuf::from("/libs/b.jar")],
            options: [("renamedupmembers".to_string(), "true".to_string())].into(),
        };
        let args = cfr.args(Path::new("/in.jar"), Path::new("/out"), &metadata)?;
        assert!(args.windows(2).any(|w| w[0] == "--extraclasspath" && w[1] == "/libs/a.jar:/libs/b.jar"));
        assert!(args.windows(2).any(|w| w[0] == "--renamedupmembers" && w[1] == "true"));
        assert_eq!(cfr.name(), "cfr:cfr.jar");
        Ok(())
    }
}
