//! The audio output feeding visualization clients
//!
//! Owns the [`RingCache`] while the device is open and tells an
//! [`OutputObserver`] (normally the connection manager) when it opens and
//! closes.

use crate::cache::RingCache;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use vis_core::{AudioFormat, Error};

/// Receives open/close notifications from a [`VisualizationOutput`].
///
/// Called from the audio thread; implementations hand the notification to
/// whatever owns the client sessions and wait until it has been applied.
pub trait OutputObserver: Send + Sync {
    fn plugin_opened(&self, cache: Arc<RingCache>) -> Result<(), Error>;
    fn plugin_closed(&self) -> Result<(), Error>;
}

/// Output device that records played PCM for analysis.
pub struct VisualizationOutput<O: OutputObserver> {
    observer: O,
    cache_span: Duration,
    cache: Option<Arc<RingCache>>,
}

impl<O: OutputObserver> VisualizationOutput<O> {
    /// `cache_span` is how much recent audio is kept for clients to look
    /// back into.
    pub fn new(observer: O, cache_span: Duration) -> Self {
        Self {
            observer,
            cache_span,
            cache: None,
        }
    }

    /// Start accepting PCM in `format`. Reopening replaces the cache.
    pub fn open(&mut self, format: AudioFormat) -> Result<(), Error> {
        if self.cache.is_some() {
            warn!("Visualization output reopened without close; closing first");
            self.close()?;
        }

        let cache = Arc::new(RingCache::new(format, self.cache_span)?);
        info!(
            "Visualization output opened: {}, caching {:?}",
            format, self.cache_span
        );

        self.cache = Some(Arc::clone(&cache));
        self.observer.plugin_opened(cache)
    }

    /// Record `data` as just played. Returns the number of bytes consumed.
    pub fn play(&self, data: &[u8]) -> Result<usize, Error> {
        match &self.cache {
            Some(cache) => {
                cache.add(data);
                Ok(data.len())
            }
            None => Err(Error::InvalidState(
                "play called on a closed visualization output".to_string(),
            )),
        }
    }

    /// Stop accepting PCM. Sessions keep their handle on the old cache until
    /// they drop it, but stop reading from it.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.cache.take().is_none() {
            debug!("Visualization output already closed");
            return Ok(());
        }

        info!("Visualization output closed");
        self.observer.plugin_closed()
    }

    pub fn is_open(&self) -> bool {
        self.cache.is_some()
    }

    pub fn cache(&self) -> Option<&Arc<RingCache>> {
        self.cache.as_ref()
    }
}

impl<O: OutputObserver> Drop for VisualizationOutput<O> {
    fn drop(&mut self) {
        if self.cache.is_some() {
            if let Err(e) = self.close() {
                warn!("Failed to notify observer on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::*;
    use vis_core::SampleFormat;

    mock! {
        Observer {}
        impl OutputObserver for Observer {
            fn plugin_opened(&self, cache: Arc<RingCache>) -> Result<(), Error>;
            fn plugin_closed(&self) -> Result<(), Error>;
        }
    }

    fn cd_format() -> AudioFormat {
        AudioFormat::new(44100, SampleFormat::S16, 2)
    }

    #[test]
    fn test_open_play_close() {
        let mut observer = MockObserver::new();
        observer
            .expect_plugin_opened()
            .withf(|cache| cache.format() == cd_format() && cache.is_empty())
            .times(1)
            .returning(|_| Ok(()));
        observer.expect_plugin_closed().times(1).returning(|| Ok(()));

        let mut output = VisualizationOutput::new(observer, Duration::from_secs(1));
        assert!(!output.is_open());
        assert!(output.play(&[0; 4]).is_err());

        output.open(cd_format()).expect("Failed to open output");
        assert!(output.is_open());

        let consumed = output.play(&[0; 400]).expect("Failed to play");
        assert_eq!(consumed, 400);
        assert_eq!(output.cache().map(|c| c.size()), Some(400));

        output.close().expect("Failed to close output");
        assert!(!output.is_open());

        // A second close is a no-op
        output.close().expect("Failed to close output");
    }

    #[test]
    fn test_reopen_closes_previous_cache() {
        let mut observer = MockObserver::new();
        let mut seq = Sequence::new();
        observer
            .expect_plugin_opened()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        observer
            .expect_plugin_closed()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        observer
            .expect_plugin_opened()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        observer
            .expect_plugin_closed()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        let mut output = VisualizationOutput::new(observer, Duration::from_secs(1));
        output.open(cd_format()).expect("Failed to open output");
        output
            .open(AudioFormat::new(48000, SampleFormat::Float, 2))
            .expect("Failed to reopen output");
        assert_eq!(
            output.cache().map(|c| c.format().sample_rate),
            Some(48000)
        );
        // Dropping the open output notifies the observer
    }

    #[test]
    fn test_invalid_format_is_rejected() {
        let observer = MockObserver::new();
        let mut output = VisualizationOutput::new(observer, Duration::from_secs(1));
        assert!(output
            .open(AudioFormat::new(44100, SampleFormat::S16, 0))
            .is_err());
        assert!(!output.is_open());
    }
}
