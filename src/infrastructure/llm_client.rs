//! 文本模型客户端 - 基础设施层
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 兼容 OpenAI API 的服务（自定义 API 端点和模型）
//!
//! 模型被视为不可靠、延迟不定的文本生成器：每次调用都有超时和重试，
//! 提示词构建和返回解析由 services 层负责。

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{AiError, AppError, AppResult};
use crate::utils::{retry_with_backoff, RetryPolicy};

/// 文本生成能力
pub trait TextModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// 根据提示词生成文本
    fn generate<'a>(
        &'a self,
        prompt: &'a str,
        system_message: Option<&'a str>,
    ) -> BoxFuture<'a, AppResult<String>>;
}

/// OpenAI 兼容接口的文本模型
pub struct OpenAiTextModel {
    client: Client<OpenAIConfig>,
    model_name: String,
    max_tokens: u32,
    timeout: Duration,
    retry: RetryPolicy,
}

impl OpenAiTextModel {
    /// 创建新的模型客户端
    pub fn new(config: &Config) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.ai_api_key)
            .with_api_base(&config.ai_api_base_url);

        Self {
            client: Client::with_config(openai_config),
            model_name: config.ai_model_name.clone(),
            max_tokens: config.ai_max_tokens,
            timeout: config.ai_request_timeout(),
            retry: RetryPolicy::new(config.ai_max_retries, Duration::from_millis(1000)),
        }
    }

    /// 单次调用（不含重试）
    async fn send_once(&self, prompt: &str, system_message: Option<&str>) -> AppResult<String> {
        let build_err = |e: async_openai::error::OpenAIError| {
            AppError::ai_request_failed(self.model_name.clone(), e)
        };

        let mut messages = Vec::new();
        if let Some(sys_msg) = system_message {
            let system_msg = ChatCompletionRequestSystemMessageArgs::default()
                .content(sys_msg)
                .build()
                .map_err(build_err)?;
            messages.push(ChatCompletionRequestMessage::System(system_msg));
        }
        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt)
            .build()
            .map_err(build_err)?;
        messages.push(ChatCompletionRequestMessage::User(user_msg));

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(messages)
            .temperature(0.3)
            .max_tokens(self.max_tokens)
            .build()
            .map_err(build_err)?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| AiError::Timeout {
                model: self.model_name.clone(),
                timeout_secs: self.timeout.as_secs(),
            })?
            .map_err(build_err)?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AiError::EmptyResponse {
                model: self.model_name.clone(),
            })?;

        Ok(content.trim().to_string())
    }
}

impl TextModel for OpenAiTextModel {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn generate<'a>(
        &'a self,
        prompt: &'a str,
        system_message: Option<&'a str>,
    ) -> BoxFuture<'a, AppResult<String>> {
        Box::pin(async move {
            debug!(
                "调用 AI 模型: {}，提示词长度: {} 字符",
                self.model_name,
                prompt.len()
            );
            let (result, attempts) = retry_with_backoff(self.retry, "AI 调用", |_| {
                self.send_once(prompt, system_message)
            })
            .await;
            if let Err(e) = &result {
                warn!("AI 调用在 {} 次尝试后失败: {}", attempts, e);
            }
            result
        })
    }
}

/// 按顺序回放预设应答的模型，用于测试和离线演示
///
/// 每次调用弹出一条应答；应答耗尽后返回 `EmptyResponse`
#[derive(Default)]
pub struct ScriptedTextModel {
    responses: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedTextModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条成功应答
    pub fn push_response(&self, text: impl Into<String>) -> &Self {
        self.lock_responses().push_back(Ok(text.into()));
        self
    }

    /// 追加一条失败应答
    pub fn push_failure(&self, message: impl Into<String>) -> &Self {
        self.lock_responses().push_back(Err(message.into()));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 已收到的提示词
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn lock_responses(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, String>>> {
        self.responses.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl TextModel for ScriptedTextModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn generate<'a>(
        &'a self,
        prompt: &'a str,
        _system_message: Option<&'a str>,
    ) -> BoxFuture<'a, AppResult<String>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(prompt.to_string());
            match self.lock_responses().pop_front() {
                Some(Ok(text)) => Ok(text),
                Some(Err(message)) => Err(AppError::ai_request_failed("scripted", message)),
                None => Err(AiError::EmptyResponse {
                    model: "scripted".to_string(),
                }
                .into()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_model_replays_in_order() {
        let model = ScriptedTextModel::new();
        model.push_response("first").push_failure("down");
        assert_eq!(model.generate("p1", None).await.unwrap(), "first");
        assert!(model.generate("p2", None).await.is_err());
        assert!(matches!(
            model.generate("p3", None).await,
            Err(AppError::Ai(AiError::EmptyResponse { .. }))
        ));
        assert_eq!(model.calls(), 3);
        assert_eq!(model.prompts(), vec!["p1", "p2", "p3"]);
    }

    /// 真实模型连通性测试
    #[tokio::test]
    #[ignore]
    async fn test_openai_model_live() {
        let _ = tracing_subscriber::fmt::try_init();
        let model = OpenAiTextModel::new(&Config::from_env());
        let response = model
            .generate("Reply with the single word: ok", Some("You are terse."))
            .await
            .unwrap();
        assert!(!response.is_empty());
    }
}
