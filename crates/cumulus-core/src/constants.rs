pub mod prefixes {
    pub const INPUT: &str = "input";
    pub const OUTPUT: &str = "output";
    pub const MOUNT: &str = "mount";

    pub const ALL: [&str; 3] = [INPUT, OUTPUT, MOUNT];
}

pub mod logs {
    pub const STDOUT: &str = "stdout.log";
    pub const STDERR: &str = "stderr.log";
    pub const SESSION_PREFIX: &str = "cumulus_";
    pub const SESSION_LINK: &str = "cumulus.log";
}

pub mod files {
    pub const WORKFLOW: &str = "workflow.json";
    pub const SOURCE_DIR: &str = "source";
    pub const CONFIG: &str = "config.toml";
}

pub mod dirs {
    pub const APP: &str = "cumulus";
    pub const LOGS: &str = "logs";
    pub const INPUTS: &str = "inputs";
    pub const OUTPUTS: &str = "outputs";
}

pub mod schemes {
    pub const LOCAL: &str = "local://";
    pub const FILE: &str = "file://";
    pub const MEMORY: &str = "memory://";
}

pub mod env {
    pub const LOG_LEVEL: &str = "CUMULUS_LOG_LEVEL";
    pub const LOG_TEE: &str = "CUMULUS_LOG_TEE";
    pub const JOB_ID: &str = "CUMULUS_JOB_ID";
    pub const STEP: &str = "CUMULUS_STEP";
    pub const ATTEMPT: &str = "CUMULUS_ATTEMPT";
}

pub mod defaults {
    pub const SERVICE_NAME: &str = "cumulus-runner";
    pub const TIMEOUT_SECONDS: u64 = 600;
    pub const MAX_RETRIES: u32 = 3;
    pub const POLL_INTERVAL_MS: u64 = 1_000;
    pub const POLL_MAX_INTERVAL_MS: u64 = 10_000;
    pub const RETRY_DELAY_MS: u64 = 1_000;
    pub const CANCEL_GRACE_MS: u64 = 5_000;
    pub const LOG_MAX_FILES: usize = 20;
    pub const LOG_MAX_AGE_DAYS: u64 = 14;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_constants() {
        assert_eq!(prefixes::INPUT, "input");
        assert_eq!(prefixes::OUTPUT, "output");
        assert_eq!(prefixes::MOUNT, "mount");
        assert_eq!(prefixes::ALL.len(), 3);
    }

    #[test]
    fn test_log_constants() {
        assert_eq!(logs::STDOUT, "stdout.log");
        assert_eq!(logs::STDERR, "stderr.log");
    }

    #[test]
    fn test_poll_defaults_are_ordered() {
        assert!(defaults::POLL_INTERVAL_MS <= defaults::POLL_MAX_INTERVAL_MS);
    }
}
