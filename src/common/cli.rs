//! CLI argument parsing for the recorder binaries
//!
//! # Design Principles (KISS)
//! - Use clap's derive macro for declarative argument definition
//! - Common arguments shared via composition, not inheritance
//! - Each binary has its own Args struct that embeds CommonArgs

use std::path::PathBuf;

use clap::Parser;

/// Arguments shared by every binary
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Path to configuration file; built-in defaults if absent
    #[arg(short = 'f', long = "config")]
    pub config_file: Option<PathBuf>,
}

/// Arguments for the `recorder` binary
#[derive(Parser, Debug, Clone)]
#[command(about = "Record emulated multi-stream data to disk")]
pub struct RecorderArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Root folder for recordings (overrides config)
    #[arg(short = 'o', long = "output")]
    pub output_dir: Option<PathBuf>,

    /// Seconds of data to record
    #[arg(short = 'd', long = "duration", default_value_t = 5.0)]
    pub duration: f64,

    /// Record engine id (overrides config)
    #[arg(short = 'e', long = "engine")]
    pub engine: Option<String>,

    /// Number of recordings within the experiment
    #[arg(short = 'n', long = "recordings", default_value_t = 1)]
    pub recordings: u32,

    /// Emulator random seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Generate data as fast as possible instead of in real time
    #[arg(long)]
    pub fast: bool,
}

/// Arguments for the `npy_inspect` binary
#[derive(Parser, Debug, Clone)]
#[command(about = "Print the header of .npy files")]
pub struct NpyInspectArgs {
    /// Files to inspect
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Also print the first N records of numeric files
    #[arg(short = 'n', long = "head", default_value_t = 0)]
    pub head: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_args_default() {
        let args = CommonArgs::try_parse_from(["test"]).unwrap();
        assert_eq!(args.config_file, None);
    }

    #[test]
    fn test_common_args_long_config() {
        let args = CommonArgs::try_parse_from(["test", "--config", "rig.toml"]).unwrap();
        assert_eq!(args.config_file, Some(PathBuf::from("rig.toml")));
    }

    #[test]
    fn test_recorder_args_default() {
        let args = RecorderArgs::try_parse_from(["test"]).unwrap();
        assert_eq!(args.duration, 5.0);
        assert_eq!(args.recordings, 1);
        assert_eq!(args.engine, None);
        assert!(!args.fast);
    }

    #[test]
    fn test_recorder_args_full() {
        let args = RecorderArgs::try_parse_from([
            "test",
            "-f",
            "rig.toml",
            "-o",
            "/tmp/rec",
            "-d",
            "2.5",
            "-e",
            "RAWBINARY",
            "-n",
            "3",
            "--seed",
            "42",
            "--fast",
        ])
        .unwrap();
        assert_eq!(args.common.config_file, Some(PathBuf::from("rig.toml")));
        assert_eq!(args.output_dir, Some(PathBuf::from("/tmp/rec")));
        assert_eq!(args.duration, 2.5);
        assert_eq!(args.engine.as_deref(), Some("RAWBINARY"));
        assert_eq!(args.recordings, 3);
        assert_eq!(args.seed, Some(42));
        assert!(args.fast);
    }

    #[test]
    fn test_npy_inspect_requires_files() {
        assert!(NpyInspectArgs::try_parse_from(["test"]).is_err());
        let args = NpyInspectArgs::try_parse_from(["test", "a.npy", "b.npy", "-n", "4"]).unwrap();
        assert_eq!(args.files.len(), 2);
        assert_eq!(args.head, 4);
    }
}
