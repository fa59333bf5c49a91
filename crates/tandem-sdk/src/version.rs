//! SDK 版本与运行时元信息
//!
//! - **SDK Version** → Cargo.toml（唯一权威源）
//! - **Snapshot Format Version** → 本模块常量，随快照结构变更手动递增
//! - **Build Metadata** → build.rs（vergen）

/// SDK semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit（由 vergen 在 build.rs 中生成，非 git 环境为 "unknown"）
pub const GIT_SHA: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

/// build time（由 vergen 在 build.rs 中生成）
pub const BUILD_TIME: &str = match option_env!("VERGEN_BUILD_TIMESTAMP") {
    Some(ts) => ts,
    None => "unknown",
};

/// 当前 SDK 能读取的最高副本快照格式版本。
///
/// 启动时若磁盘快照的 format_version 大于此值则丢弃快照（防 downgrade 后读到不兼容结构），
/// 从空副本重新全量同步。
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// 用于日志打印的一行版本信息
pub fn version_line() -> String {
    format!("tandem-sdk {} ({}, built {})", SDK_VERSION, GIT_SHA, BUILD_TIME)
}
