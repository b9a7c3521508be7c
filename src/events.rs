//! Event types for UnAudio

use crate::voice::VoiceHandle;

/// Events produced by the render callback and consumed by application threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnAudioEvent {
    /// A non-looping voice reached the end of its source
    VoiceFinished { voice: VoiceHandle },
    /// A looping voice wrapped back to its start `wraps` times in one callback
    VoiceLooped { voice: VoiceHandle, wraps: u32 },
    /// A callback overran its real-time deadline
    BufferUnderrun { overrun_us: u32 },
    /// The output device was lost or changed
    DeviceChanged,
    /// A voice could not be rendered and was silenced for one period
    VoiceFault { voice: VoiceHandle, code: i32 },
}

/// Numeric event kinds used at the flat API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    VoiceFinished = 1,
    VoiceLooped = 2,
    BufferUnderrun = 3,
    DeviceChanged = 4,
    VoiceFault = 5,
}

/// Fault code: the attached source holds no frames; the voice was stopped.
pub const FAULT_EMPTY_SOURCE: i32 = 1;

/// Flat representation: `(kind, voice_id, param)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: u8,
    pub voice_id: i32,
    pub param: i32,
}

impl UnAudioEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::VoiceFinished { .. } => EventKind::VoiceFinished,
            Self::VoiceLooped { .. } => EventKind::VoiceLooped,
            Self::BufferUnderrun { .. } => EventKind::BufferUnderrun,
            Self::DeviceChanged => EventKind::DeviceChanged,
            Self::VoiceFault { .. } => EventKind::VoiceFault,
        }
    }

    pub fn voice(&self) -> Option<VoiceHandle> {
        match self {
            Self::VoiceFinished { voice }
            | Self::VoiceLooped { voice, .. }
            | Self::VoiceFault { voice, .. } => Some(*voice),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::BufferUnderrun { .. } | Self::DeviceChanged | Self::VoiceFault { .. }
        )
    }

    pub fn to_raw(&self) -> RawEvent {
        let voice_id = self.voice().unwrap_or(VoiceHandle::INVALID).raw();
        let param = match self {
            Self::VoiceFinished { .. } | Self::DeviceChanged => 0,
            Self::VoiceLooped { wraps, .. } => *wraps as i32,
            Self::BufferUnderrun { overrun_us } => *overrun_us as i32,
            Self::VoiceFault { code, .. } => *code,
        };
        RawEvent {
            kind: self.kind() as u8,
            voice_id,
            param,
        }
    }

    pub fn from_raw(raw: RawEvent) -> Option<Self> {
        let voice = VoiceHandle::from_raw(raw.voice_id);
        match raw.kind {
            1 => Some(Self::VoiceFinished { voice }),
            2 => Some(Self::VoiceLooped {
                voice,
                wraps: raw.param.max(0) as u32,
            }),
            3 => Some(Self::BufferUnderrun {
                overrun_us: raw.param.max(0) as u32,
            }),
            4 => Some(Self::DeviceChanged),
            5 => Some(Self::VoiceFault {
                voice,
                code: raw.param,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_form_carries_kind_voice_and_param() {
        let voice = VoiceHandle::new(3, 9);
        let raw = UnAudioEvent::VoiceLooped { voice, wraps: 2 }.to_raw();
        assert_eq!(raw.kind, EventKind::VoiceLooped as u8);
        assert_eq!(raw.voice_id, voice.raw());
        assert_eq!(raw.param, 2);

        let raw = UnAudioEvent::BufferUnderrun { overrun_us: 1500 }.to_raw();
        assert_eq!(raw.voice_id, -1);
        assert_eq!(raw.param, 1500);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let raw = RawEvent {
            kind: 0,
            voice_id: 0,
            param: 0,
        };
        assert_eq!(UnAudioEvent::from_raw(raw), None);
    }

    #[test]
    fn classification() {
        let voice = VoiceHandle::new(0, 0);
        assert!(!UnAudioEvent::VoiceFinished { voice }.is_error());
        assert!(UnAudioEvent::DeviceChanged.is_error());
        assert_eq!(UnAudioEvent::DeviceChanged.voice(), None);
        assert_eq!(
            UnAudioEvent::VoiceFault { voice, code: 1 }.voice(),
            Some(voice)
        );
    }
}
