use anyhow::Result;
use doc_grader::utils::logging;
use doc_grader::{App, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置：命令行给出配置文件时从文件读取，否则读环境变量
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)?,
        None => Config::from_env(),
    };

    logging::init(config.verbose_logging);

    App::initialize(config).await?.run().await?;

    Ok(())
}
