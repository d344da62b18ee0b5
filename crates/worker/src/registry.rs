//! Known worker identities.
//!
//! | Identity               | Queue                 | Routing pattern       |
//! |------------------------|-----------------------|-----------------------|
//! | `sd_webui_worker_sd15` | `sd_webui_sd15_queue` | `*.sd15_webui.worker` |
//! | `sd_webui_worker_sdxl` | `sd_webui_sdxl_queue` | `*.sdxl_webui.worker` |
//!
//! Every identity runs the same job processor; they differ only in the
//! queue they consume.

/// A worker identity, selected with `--worker` or `WORKER_NAME`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WorkerKind {
    #[value(name = "sd_webui_worker_sd15")]
    Sd15,
    #[value(name = "sd_webui_worker_sdxl")]
    Sdxl,
}

impl WorkerKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Sd15 => "sd_webui_worker_sd15",
            Self::Sdxl => "sd_webui_worker_sdxl",
        }
    }

    pub fn default_queue(self) -> &'static str {
        match self {
            Self::Sd15 => "sd_webui_sd15_queue",
            Self::Sdxl => "sd_webui_sdxl_queue",
        }
    }

    pub fn default_routing_key(self) -> &'static str {
        match self {
            Self::Sd15 => "*.sd15_webui.worker",
            Self::Sdxl => "*.sdxl_webui.worker",
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a worker identity consumes from, after config overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerBinding {
    pub kind: WorkerKind,
    pub queue: String,
    pub routing_key: String,
}

#[cfg(test)]
mod tests {
    use clap::ValueEnum;

    use super::*;

    #[test]
    fn names_round_trip_through_clap() {
        for kind in WorkerKind::value_variants() {
            assert_eq!(WorkerKind::from_str(kind.name(), false).unwrap(), *kind);
        }
    }

    #[test]
    fn identities_use_distinct_queues() {
        assert_ne!(WorkerKind::Sd15.default_queue(), WorkerKind::Sdxl.default_queue());
        assert_eq!(WorkerKind::Sdxl.to_string(), "sd_webui_worker_sdxl");
    }
}
