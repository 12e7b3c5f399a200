//! 语音播报 - 新订单的语音提示

pub mod announcer;
pub mod speech;
pub mod template;

pub use announcer::{SpeakOutcome, UtteranceId, VoiceAnnouncer, VoiceEvent, VoiceState};
pub use speech::{CommandSpeechEngine, NullSpeechEngine, SpeechEngine};
pub use template::order_announcement;
