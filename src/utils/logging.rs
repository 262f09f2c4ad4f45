//! 日志工具模块
//!
//! 提供日志初始化、格式化和输出的辅助函数
use anyhow::Result;
use std::fs;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 初始化全局日志订阅者
///
/// 默认级别为 `info`（`verbose` 时为 `debug`），可通过 `RUST_LOG` 覆盖。
/// 重复调用是安全的，只有第一次生效。
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 初始化日志文件
///
/// # 参数
/// - `log_file_path`: 日志文件路径
pub fn init_log_file(log_file_path: &str) -> Result<()> {
    let log_header = format!(
        "{}\n文档处理日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(log_file_path, log_header)?;
    Ok(())
}

/// 追加一行到日志文件
pub fn append_log_line(log_file_path: &str, line: &str) -> Result<()> {
    use std::io::Write;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// 记录程序启动信息
pub fn log_startup(max_concurrent: usize, mode: &str) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 文档抽取批处理模式");
    info!("📊 最大并发数: {}", max_concurrent);
    info!("🧠 抽取模式: {}", mode);
    info!("{}", "=".repeat(60));
}

/// 记录作业清单加载信息
pub fn log_manifests_loaded(total: usize, max_concurrent: usize) {
    info!("✓ 找到 {} 个待处理的作业", total);
    info!("📋 将以每批 {} 个的方式处理\n", max_concurrent);
}

/// 记录批次开始信息
pub fn log_batch_start(batch_num: usize, total_batches: usize, start: usize, end: usize, total: usize) {
    info!("\n{}", "=".repeat(60));
    info!("📦 开始处理第 {}/{} 批", batch_num, total_batches);
    info!("📄 本批作业: {}-{} / 共 {} 个", start, end, total);
    info!("{}", "=".repeat(60));
}

/// 记录批次完成信息
pub fn log_batch_complete(batch_num: usize, success: usize, total: usize) {
    info!("\n{}", "─".repeat(60));
    info!("✓ 第 {} 批完成: 成功 {}/{}", batch_num, success, total);
    info!("{}", "─".repeat(60));
}

/// 打印最终统计信息
pub fn print_final_stats(
    completed: usize,
    no_questions: usize,
    failed: usize,
    total: usize,
    log_file_path: &str,
) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功抽取: {}/{}", completed, total);
    info!("📭 未发现题目: {}", no_questions);
    info!("❌ 失败: {}", failed);
    info!("{}", "=".repeat(60));
    info!("\n日志已保存至: {}", log_file_path);
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度（字符数）
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
