//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ASSISTANT__*` 覆盖（双下划线表示嵌套，如 `ASSISTANT__LLM__PROVIDER=anthropic`）。

use std::path::PathBuf;
use std::time::Duration;

use secrecy::Secret;
use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub clinic: ClinicSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub whatsapp: WhatsappSection,
}

/// [app] 段：历史上限、会话 TTL、近期历史窗口、清理周期
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 每个会话保留的最大消息数（超出时丢弃最旧）
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// 会话空闲多久后被清理（小时）
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: u64,
    /// 发给 LLM 的最近消息条数
    #[serde(default = "default_recent_history_window")]
    pub recent_history_window: usize,
    /// 过期清理周期（秒）
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 提示词模板目录，未设置时用 config/prompts
    pub prompts_dir: Option<PathBuf>,
}

fn default_max_history() -> usize {
    20
}

fn default_session_ttl_hours() -> u64 {
    24
}

fn default_recent_history_window() -> usize {
    10
}

fn default_eviction_interval_secs() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_history: default_max_history(),
            session_ttl_hours: default_session_ttl_hours(),
            recent_history_window: default_recent_history_window(),
            eviction_interval_secs: default_eviction_interval_secs(),
            log_level: default_log_level(),
            prompts_dir: None,
        }
    }
}

impl AppSection {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_hours * 3600)
    }
}

/// [llm] 段：后端选择、凭据、超时与各后端生成参数
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / anthropic / google / deepseek / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    /// 显式凭据；为空时回落到各后端约定的环境变量
    pub api_key: Option<Secret<String>>,
    /// 单次生成调用的超时（秒），超时按 TransientError 处理
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "GenerationParams::openai")]
    pub openai: GenerationParams,
    #[serde(default = "GenerationParams::anthropic")]
    pub anthropic: GenerationParams,
    #[serde(default = "GenerationParams::google")]
    pub google: GenerationParams,
    #[serde(default = "GenerationParams::deepseek")]
    pub deepseek: GenerationParams,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            timeout_secs: default_request_timeout(),
            openai: GenerationParams::openai(),
            anthropic: GenerationParams::anthropic(),
            google: GenerationParams::google(),
            deepseek: GenerationParams::deepseek(),
        }
    }
}

impl LlmSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// 单个后端的固定生成参数（缺省值沿用各后端的推荐配置）
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GenerationParams {
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_temperature() -> f32 {
    0.7
}

impl GenerationParams {
    fn with_model(model: &str) -> Self {
        Self {
            model: model.to_string(),
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: None,
            top_k: None,
            presence_penalty: None,
            frequency_penalty: None,
        }
    }

    pub fn openai() -> Self {
        Self {
            presence_penalty: Some(0.6),
            frequency_penalty: Some(0.3),
            ..Self::with_model("gpt-4-turbo-preview")
        }
    }

    pub fn anthropic() -> Self {
        Self::with_model("claude-3-opus-20240229")
    }

    pub fn google() -> Self {
        Self {
            top_p: Some(0.95),
            top_k: Some(40),
            ..Self::with_model("gemini-1.5-flash")
        }
    }

    pub fn deepseek() -> Self {
        Self::with_model("deepseek-chat")
    }
}

/// [clinic] 段：填入人设模板的诊所信息；phone 同时是降级回复里的人工联系方式
#[derive(Debug, Clone, Deserialize)]
pub struct ClinicSection {
    #[serde(default = "default_clinic_name")]
    pub name: String,
    #[serde(default = "default_clinic_address")]
    pub address: String,
    #[serde(default = "default_clinic_hours")]
    pub hours: String,
    #[serde(default = "default_clinic_phone")]
    pub phone: String,
}

fn default_clinic_name() -> String {
    "Clínica Odontológica Sorriso".to_string()
}

fn default_clinic_address() -> String {
    "Rua das Flores, 123 - Centro".to_string()
}

fn default_clinic_hours() -> String {
    "Segunda a Sexta 8h-18h, Sábado 8h-12h".to_string()
}

fn default_clinic_phone() -> String {
    "(11) 9999-9999".to_string()
}

impl Default for ClinicSection {
    fn default() -> Self {
        Self {
            name: default_clinic_name(),
            address: default_clinic_address(),
            hours: default_clinic_hours(),
            phone: default_clinic_phone(),
        }
    }
}

/// [server] 段：HTTP 监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// [whatsapp] 段：Cloud API 凭据、Webhook 验证令牌、重连策略
#[derive(Debug, Clone, Deserialize)]
pub struct WhatsappSection {
    pub access_token: Option<Secret<String>>,
    pub phone_number_id: Option<String>,
    #[serde(default = "default_verify_token")]
    pub verify_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// 号码缺少国家码时补上（默认巴西 55）
    #[serde(default = "default_country_code")]
    pub default_country_code: String,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// 连接正常时的探活间隔（秒）
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

fn default_verify_token() -> String {
    "clinic".to_string()
}

fn default_api_base() -> String {
    "https://graph.facebook.com/v18.0".to_string()
}

fn default_country_code() -> String {
    "55".to_string()
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_keepalive_secs() -> u64 {
    300
}

impl Default for WhatsappSection {
    fn default() -> Self {
        Self {
            access_token: None,
            phone_number_id: None,
            verify_token: default_verify_token(),
            api_base: default_api_base(),
            default_country_code: default_country_code(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 ASSISTANT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ASSISTANT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ASSISTANT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
