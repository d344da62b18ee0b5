use clap::Parser;

use crate::registry::WorkerKind;

/// Stable Diffusion WebUI queue worker.
#[derive(Debug, Parser)]
#[command(name = "sdrelay-worker", version)]
pub struct Args {
    /// Worker identity; selects the queue to consume.
    #[arg(short, long, env = "WORKER_NAME", value_enum)]
    pub worker: WorkerKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_identity() {
        let args = Args::try_parse_from(["sdrelay-worker", "-w", "sd_webui_worker_sdxl"]).unwrap();
        assert_eq!(args.worker, WorkerKind::Sdxl);
    }

    #[test]
    fn rejects_unknown_identity() {
        assert!(Args::try_parse_from(["sdrelay-worker", "--worker", "comfy_worker"]).is_err());
    }
}
