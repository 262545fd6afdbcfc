use cacophony_base::ContentAddress;
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Where the home channel is published from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// API address of the storage node.
    pub host: String,
    /// Name of the key the channel publishes under.
    pub key_name: String,
}

impl From<&Config> for ChannelConfig {
    fn from(config: &Config) -> Self {
        Self {
            host: config.api_host.clone(),
            key_name: config.key_name.clone(),
        }
    }
}

/// Home channel state: its config and the last root it published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelData {
    config: Option<ChannelConfig>,
    last_published_root: Option<ContentAddress>,
}

impl ChannelData {
    pub fn config(&self) -> Option<&ChannelConfig> {
        self.config.as_ref()
    }

    pub fn last_published_root(&self) -> Option<ContentAddress> {
        self.last_published_root
    }

    pub(crate) fn set_config(&mut self, config: ChannelConfig) {
        self.config = Some(config);
    }

    pub(crate) fn set_last_published_root(&mut self, root: ContentAddress) {
        self.last_published_root = Some(root);
    }
}
