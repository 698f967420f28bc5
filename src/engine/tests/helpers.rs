#![cfg(test)]

use crate::engine::DbConfig;

/// Small buffers and budgets so flush and compaction trip quickly.
pub fn tiny_config() -> DbConfig {
    DbConfig {
        write_buffer_size: 4096,
        max_frozen_memtables: 2,
        l0_compaction_trigger: 4,
        level_base_bytes: 16 * 1024,
        level_growth_factor: 10,
        target_run_bytes: 32 * 1024,
        compaction_retry_base_ms: 10,
        compaction_max_retries: 3,
    }
}

pub fn init_tracing() {
    use tracing_subscriber::fmt::Subscriber;
    let _ = Subscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
