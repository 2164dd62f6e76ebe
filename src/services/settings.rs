//! Live system settings consulted on every tone request

use std::sync::RwLock;

use tracing::info;

use crate::config::DtmfConfig;
use crate::interfaces::SettingsProvider;
use crate::protocols::dtmf::DtmfToneType;

#[derive(Debug, Default)]
pub struct SystemSettings {
    dtmf_tone_type: RwLock<Option<DtmfToneType>>,
}

impl SystemSettings {
    pub fn new(dtmf_tone_type: Option<DtmfToneType>) -> Self {
        Self {
            dtmf_tone_type: RwLock::new(dtmf_tone_type),
        }
    }

    pub fn from_config(config: &DtmfConfig) -> Self {
        Self::new(config.tone_type)
    }

    pub fn set_dtmf_tone_type(&self, tone_type: Option<DtmfToneType>) {
        let mut current = self
            .dtmf_tone_type
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = tone_type;
        info!("DTMF tone type set to {:?}", tone_type);
    }
}

impl SettingsProvider for SystemSettings {
    fn dtmf_tone_type(&self) -> Option<DtmfToneType> {
        *self
            .dtmf_tone_type
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
