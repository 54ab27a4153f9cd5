//! Playback queue handed in by the player when asking for neighbor pre-caching.

use serde::{Deserialize, Serialize};

/// A playable recitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub url: String,
    pub reciter: Option<String>,
}

impl Track {
    pub fn new(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            url: url.into(),
            reciter: None,
        }
    }

    pub fn with_reciter(mut self, reciter: impl Into<String>) -> Self {
        self.reciter = Some(reciter.into());
        self
    }
}

/// Current queue and position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackContext {
    pub queue: Vec<Track>,
    pub current_index: usize,
    /// Whether the queue loops around at either end
    pub wrap: bool,
}

impl PlaybackContext {
    pub fn new(queue: Vec<Track>, current_index: usize) -> Self {
        Self {
            queue,
            current_index,
            wrap: false,
        }
    }

    pub fn with_wrap(mut self, wrap: bool) -> Self {
        self.wrap = wrap;
        self
    }

    pub fn current(&self) -> Option<&Track> {
        self.queue.get(self.current_index)
    }

    pub fn next(&self) -> Option<&Track> {
        let len = self.queue.len();
        if self.current_index >= len {
            return None;
        }

        if self.current_index + 1 < len {
            self.queue.get(self.current_index + 1)
        } else if self.wrap && len > 1 {
            self.queue.first()
        } else {
            None
        }
    }

    pub fn previous(&self) -> Option<&Track> {
        let len = self.queue.len();
        if self.current_index >= len {
            return None;
        }

        if self.current_index > 0 {
            self.queue.get(self.current_index - 1)
        } else if self.wrap && len > 1 {
            self.queue.last()
        } else {
            None
        }
    }

    /// Next and previous tracks, without repeats or the current track.
    pub fn neighbors(&self) -> Vec<&Track> {
        let current_id = self.current().map(|t| t.id.as_str());
        let mut neighbors: Vec<&Track> = Vec::with_capacity(2);

        for track in [self.next(), self.previous()].into_iter().flatten() {
            if Some(track.id.as_str()) == current_id {
                continue;
            }
            if neighbors.iter().any(|t| t.id == track.id) {
                continue;
            }
            neighbors.push(track);
        }
        neighbors
    }
}
