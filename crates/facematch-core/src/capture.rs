//! Live capture sources for registration.
//!
//! A [`CaptureSource`] is polled in a blocking loop. [`CaptureSession`] owns
//! the open device and releases it when dropped, so every exit from the loop
//! (submit, cancel, no face, error) gives the device back.

use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("frame read failed: {0}")]
    ReadFailed(String),
}

/// One step of the capture loop.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// A preview frame was shown; keep polling.
    Preview,
    /// The operator accepted this frame.
    Submit(RgbImage),
    /// The operator aborted registration.
    Cancel,
    /// The device stopped producing frames.
    Closed,
}

/// A camera (or anything shaped like one) driven by an operator.
pub trait CaptureSource {
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Block until the next event.
    fn poll(&mut self) -> Result<CaptureEvent, CaptureError>;

    /// Give the device back. Called exactly once per successful `open`.
    fn release(&mut self);
}

/// An opened [`CaptureSource`], released on drop.
pub struct CaptureSession<'a, C: CaptureSource + ?Sized> {
    source: &'a mut C,
}

impl<'a, C: CaptureSource + ?Sized> CaptureSession<'a, C> {
    pub fn open(source: &'a mut C) -> Result<Self, CaptureError> {
        source.open()?;
        tracing::debug!("capture device opened");
        Ok(Self { source })
    }

    pub fn poll(&mut self) -> Result<CaptureEvent, CaptureError> {
        self.source.poll()
    }
}

impl<C: CaptureSource + ?Sized> Drop for CaptureSession<'_, C> {
    fn drop(&mut self) {
        self.source.release();
        tracing::debug!("capture device released");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted source that records open/release calls.
    #[derive(Default)]
    pub struct ScriptedSource {
        pub events: VecDeque<Result<CaptureEvent, String>>,
        pub opened: usize,
        pub released: usize,
        pub fail_open: bool,
    }

    impl ScriptedSource {
        pub fn new(events: impl IntoIterator<Item = CaptureEvent>) -> Self {
            Self {
                events: events.into_iter().map(Ok).collect(),
                ..Self::default()
            }
        }

        pub fn is_open(&self) -> bool {
            self.opened > self.released
        }
    }

    impl CaptureSource for ScriptedSource {
        fn open(&mut self) -> Result<(), CaptureError> {
            if self.fail_open {
                return Err(CaptureError::DeviceUnavailable("scripted".into()));
            }
            self.opened += 1;
            Ok(())
        }

        fn poll(&mut self) -> Result<CaptureEvent, CaptureError> {
            match self.events.pop_front() {
                Some(Ok(event)) => Ok(event),
                Some(Err(msg)) => Err(CaptureError::ReadFailed(msg)),
                None => Ok(CaptureEvent::Closed),
            }
        }

        fn release(&mut self) {
            self.released += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedSource;
    use super::*;

    #[test]
    fn test_session_releases_on_drop() {
        let mut source = ScriptedSource::new([CaptureEvent::Preview]);
        {
            let mut session = CaptureSession::open(&mut source).unwrap();
            assert_eq!(session.poll().unwrap(), CaptureEvent::Preview);
        }
        assert_eq!(source.opened, 1);
        assert_eq!(source.released, 1);
    }

    #[test]
    fn test_session_releases_after_read_error() {
        let mut source = ScriptedSource::default();
        source.events.push_back(Err("usb unplugged".into()));
        let result = (|| -> Result<CaptureEvent, CaptureError> {
            let mut session = CaptureSession::open(&mut source)?;
            session.poll()
        })();
        assert!(matches!(result, Err(CaptureError::ReadFailed(_))));
        assert!(!source.is_open());
    }

    #[test]
    fn test_failed_open_is_not_released() {
        let mut source = ScriptedSource {
            fail_open: true,
            ..ScriptedSource::default()
        };
        assert!(CaptureSession::open(&mut source).is_err());
        assert_eq!(source.released, 0);
    }
}
