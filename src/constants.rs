// API Constants
pub const DEFAULT_API_URL: &str = "https://sm-bot-backend.vercel.app";
pub const DEFAULT_MODEL: &str = "gpt-3.5";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

// Environment overrides
pub const API_URL_ENV: &str = "PALAVER_API_URL";
pub const LOG_LEVEL_ENV: &str = "PALAVER_LOG";

// Stream framing
pub const DATA_PREFIX: &str = "data: ";

// Shown in place of an assistant reply when a request fails
pub const SEND_ERROR_MESSAGE: &str = "Sorry, I encountered an error. Please try again.";

// Sidebar titles
pub const UNTITLED_CONVERSATION: &str = "New Chat";
pub const TITLE_MAX_LENGTH: usize = 50;
