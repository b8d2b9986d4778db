use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Placeholder for the concat list file written next to the segments.
pub const LIST_PLACEHOLDER: &str = "{list}";
/// Placeholder expanded into one argument per segment, in index order.
pub const INPUTS_PLACEHOLDER: &str = "{inputs}";
/// Placeholder for the file the tool must produce.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Command line of the external muxing tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for MuxCommand {
    fn default() -> Self {
        Self::ffmpeg()
    }
}

impl MuxCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn ffmpeg() -> Self {
        Self::new(
            "ffmpeg",
            [
                "-y",
                "-loglevel",
                "error",
                "-f",
                "concat",
                "-safe",
                "0",
                "-i",
                LIST_PLACEHOLDER,
                "-c",
                "copy",
                "-movflags",
                "+faststart",
                OUTPUT_PLACEHOLDER,
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        )
    }

    pub fn needs_list_file(&self) -> bool {
        self.args.iter().any(|a| a.contains(LIST_PLACEHOLDER))
    }

    /// Base name of the program, used to recognise stray instances in the process table.
    pub fn program_name(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone())
    }

    pub fn build_args(&self, list_file: &Path, inputs: &[PathBuf], output: &Path) -> Vec<OsString> {
        let mut args = Vec::with_capacity(self.args.len() + inputs.len());
        for arg in &self.args {
            if arg == INPUTS_PLACEHOLDER {
                args.extend(inputs.iter().map(|p| p.as_os_str().to_os_string()));
                continue;
            }
            let expanded = arg
                .replace(LIST_PLACEHOLDER, &list_file.to_string_lossy())
                .replace(OUTPUT_PLACEHOLDER, &output.to_string_lossy());
            args.push(OsString::from(expanded));
        }
        args
    }

    /// Start the tool with stderr captured. The child is killed if its handle is dropped.
    pub fn spawn(
        &self,
        working_dir: &Path,
        list_file: &Path,
        inputs: &[PathBuf],
        output: &Path,
    ) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(self.build_args(list_file, inputs, output))
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Write an ffmpeg concat demuxer list, one `file '<path>'` line per segment.
pub async fn write_concat_list(path: &Path, segments: &[PathBuf]) -> std::io::Result<()> {
    let mut list = String::new();
    for segment in segments {
        let escaped = segment.to_string_lossy().replace('\'', r"'\''");
        list.push_str(&format!("file '{}'\n", escaped));
    }
    tokio::fs::write(path, list).await
}
