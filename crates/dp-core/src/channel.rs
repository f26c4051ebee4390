//! DAQ channel specifications
//!
//! Channel names follow the NI physical-channel convention, resolved
//! relative to the selected device: analog outputs are `ao0`, `ao1`, …,
//! digital lines are `port0/line0`, and analog inputs are `ai0`, `ai1`, ….

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Channels a playback job drives (or, for AI, merely reserves).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Analog output lines carrying audio.
    pub ao_channels: Vec<String>,
    /// Digital lines held HIGH while audio is generating (TTL sync).
    pub do_channels: Vec<String>,
    /// Analog inputs. Validated but never driven; reserved for capture.
    #[serde(default)]
    pub ai_channels: Vec<String>,
}

impl Default for ChannelSpec {
    fn default() -> Self {
        Self {
            ao_channels: vec!["ao0".into(), "ao1".into()],
            do_channels: vec!["port0/line0".into(), "port0/line1".into()],
            ai_channels: Vec::new(),
        }
    }
}

impl ChannelSpec {
    pub fn new(ao: Vec<String>, dout: Vec<String>, ain: Vec<String>) -> Self {
        let mut spec = Self {
            ao_channels: ao,
            do_channels: dout,
            ai_channels: ain,
        };
        if spec.do_channels.is_empty() {
            spec.do_channels = ChannelSpec::default().do_channels;
        }
        spec
    }

    /// Number of AO lines audio fans out to.
    pub fn ao_count(&self) -> usize {
        self.ao_channels.len()
    }

    /// Check structural validity: at least one AO line, no duplicates
    /// within a list, every name parseable in its naming scheme.
    pub fn check(&self) -> Result<(), ValidationError> {
        if self.ao_channels.is_empty() {
            return Err(ValidationError::NoOutputChannels);
        }

        for name in &self.ao_channels {
            if ao_index(name).is_none() {
                return Err(ValidationError::BadChannelName(name.clone()));
            }
        }
        for name in &self.do_channels {
            if do_line(name).is_none() {
                return Err(ValidationError::BadChannelName(name.clone()));
            }
        }
        for name in &self.ai_channels {
            if ai_index(name).is_none() {
                return Err(ValidationError::BadChannelName(name.clone()));
            }
        }

        for list in [&self.ao_channels, &self.do_channels, &self.ai_channels] {
            let mut seen = std::collections::HashSet::new();
            for name in list {
                if !seen.insert(name.as_str()) {
                    return Err(ValidationError::DuplicateChannel(name.clone()));
                }
            }
        }

        Ok(())
    }
}

/// Parse the line index out of an `aoN` name.
pub fn ao_index(name: &str) -> Option<u32> {
    name.strip_prefix("ao")?.parse().ok()
}

/// Parse the line index out of an `aiN` name.
pub fn ai_index(name: &str) -> Option<u32> {
    name.strip_prefix("ai")?.parse().ok()
}

/// Parse a `portP/lineL` name into (port, line).
pub fn do_line(name: &str) -> Option<(u32, u32)> {
    let (port, line) = name.split_once('/')?;
    let port = port.strip_prefix("port")?.parse().ok()?;
    let line = line.strip_prefix("line")?.parse().ok()?;
    Some((port, line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_parsing() {
        assert_eq!(ao_index("ao0"), Some(0));
        assert_eq!(ao_index("ao13"), Some(13));
        assert_eq!(ao_index("a0"), None);
        assert_eq!(do_line("port0/line1"), Some((0, 1)));
        assert_eq!(do_line("port1line1"), None);
        assert_eq!(ai_index("ai2"), Some(2));
    }

    #[test]
    fn test_default_spec_is_valid() {
        let spec = ChannelSpec::default();
        assert!(spec.check().is_ok());
        assert_eq!(spec.ao_count(), 2);
        assert_eq!(spec.do_channels.len(), 2);
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let spec = ChannelSpec::new(
            vec!["ao0".into(), "ao0".into()],
            vec![],
            vec![],
        );
        assert!(matches!(
            spec.check(),
            Err(ValidationError::DuplicateChannel(_))
        ));
    }

    #[test]
    fn test_empty_ao_rejected() {
        let spec = ChannelSpec {
            ao_channels: vec![],
            do_channels: vec!["port0/line0".into()],
            ai_channels: vec![],
        };
        assert!(matches!(spec.check(), Err(ValidationError::NoOutputChannels)));
    }

    #[test]
    fn test_bad_name_rejected() {
        let spec = ChannelSpec::new(vec!["analog3".into()], vec![], vec![]);
        assert!(matches!(spec.check(), Err(ValidationError::BadChannelName(_))));
    }
}
