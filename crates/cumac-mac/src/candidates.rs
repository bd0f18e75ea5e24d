//! Candidate data channels for one handshake.

use cumac_common::ChannelId;

/// Append channels from `pool` that are not already in `channels` until
/// `channels` holds `target` entries or the pool runs out.
pub fn pad_channels(
    channels: &mut Vec<ChannelId>,
    pool: impl IntoIterator<Item = ChannelId>,
    target: usize,
) {
    for channel in pool {
        if channels.len() >= target {
            break;
        }
        if !channels.contains(&channel) {
            channels.push(channel);
        }
    }
}

/// Ordered channel list with a cursor. Once every channel has been tried
/// the list is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCandidates {
    channels: Vec<ChannelId>,
    cursor: usize,
    exhausted: bool,
}

impl ChannelCandidates {
    pub fn new(channels: Vec<ChannelId>) -> Self {
        let exhausted = channels.is_empty();
        Self {
            channels,
            cursor: 0,
            exhausted,
        }
    }

    /// `None` once exhausted, even if `cursor` still indexes a channel.
    pub fn current(&self) -> Option<ChannelId> {
        if self.exhausted {
            return None;
        }
        self.channels.get(self.cursor).copied()
    }

    /// Move to the next channel and return it.
    pub fn advance(&mut self) -> Option<ChannelId> {
        if self.exhausted {
            return None;
        }
        if self.cursor + 1 < self.channels.len() {
            self.cursor += 1;
        } else {
            self.exhausted = true;
        }
        self.current()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_channels() {
        let mut channels = vec![4];
        pad_channels(&mut channels, 1..9, 3);
        assert_eq!(channels, vec![4, 1, 2]);

        let mut short = vec![];
        pad_channels(&mut short, [5, 5, 6], 3);
        assert_eq!(short, vec![5, 6]);
    }

    #[test]
    fn test_cursor_exhaustion() {
        let mut candidates = ChannelCandidates::new(vec![2, 7]);
        assert_eq!(candidates.current(), Some(2));
        assert_eq!(candidates.advance(), Some(7));
        assert!(!candidates.is_exhausted());
        assert_eq!(candidates.advance(), None);
        assert!(candidates.is_exhausted());
        assert_eq!(candidates.advance(), None);
        assert_eq!(candidates.current(), None);
        assert_eq!(candidates.channels(), &[2, 7]);

        assert!(ChannelCandidates::new(Vec::new()).is_exhausted());
    }
}
