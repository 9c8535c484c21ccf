use crate::{Error, Result};
use bytes::Bytes;
use std::{
    collections::HashMap,
    path::PathBuf,
    str::FromStr,
    sync::RwLock,
    time::Duration,
};

/// Built-in tones a media participant can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Digit(char),
    DialTone,
    Busy,
    FastBusy,
    Ringback,
    Ring,
    Backspace,
    CallWaiting,
    Holding,
    LoudFastBusy,
}

impl FromStr for Tone {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dialtone" => Ok(Tone::DialTone),
            "busy" => Ok(Tone::Busy),
            "fastbusy" => Ok(Tone::FastBusy),
            "ringback" => Ok(Tone::Ringback),
            "ring" => Ok(Tone::Ring),
            "backspace" => Ok(Tone::Backspace),
            "callwaiting" => Ok(Tone::CallWaiting),
            "holding" => Ok(Tone::Holding),
            "loudfastbusy" => Ok(Tone::LoudFastBusy),
            other => {
                let mut chars = other.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None)
                        if c.is_ascii_digit()
                            || c == '*'
                            || c == '#'
                            || ('a'..='d').contains(&c) =>
                    {
                        Ok(Tone::Digit(c.to_ascii_uppercase()))
                    }
                    _ => Err(Error::MediaUrlError(format!("unknown tone: {}", s))),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Tone(Tone),
    File(PathBuf),
    Cache(String),
    Record(PathBuf),
}

/// A parsed media URL:
/// `tone:<digit|name>`, `file:<path>`, `cache:<name>`, `record:<path>`
/// with optional `;duration=<ms>`, `;repeat`, `;append`,
/// `;silencetime=<ms>` parameters.
///
/// `repeat` only makes sense for playback; `append` and `silencetime`
/// only for recording. Audio files are 16-bit mono 8kHz PCM, with WAV
/// and AU containers accepted for playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUrl {
    pub source: MediaSource,
    pub duration: Option<Duration>,
    pub repeat: bool,
    pub append: bool,
    pub silence_time: Option<Duration>,
}

impl MediaUrl {
    pub fn is_playback(&self) -> bool {
        !matches!(self.source, MediaSource::Record(_))
    }
}

const PLAYBACK_EXTENSIONS: [&str; 3] = ["wav", "au", "raw"];

impl FromStr for MediaUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::MediaUrlError(format!("no scheme in media url: {}", s)))?;

        let mut parts = rest.split(';');
        let target = parts.next().unwrap_or_default();
        // allow file://path alongside file:path
        let target = target.strip_prefix("//").unwrap_or(target);
        if target.is_empty() {
            return Err(Error::MediaUrlError(format!("empty media target: {}", s)));
        }

        let source = match scheme.to_ascii_lowercase().as_str() {
            "tone" => MediaSource::Tone(target.parse()?),
            "file" => {
                let path = PathBuf::from(target.replace('|', ":"));
                let known = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| PLAYBACK_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false);
                if !known {
                    return Err(Error::MediaUrlError(format!(
                        "unsupported playback format: {}",
                        target
                    )));
                }
                MediaSource::File(path)
            }
            "cache" => MediaSource::Cache(target.to_string()),
            "record" => MediaSource::Record(PathBuf::from(target.replace('|', ":"))),
            other => {
                return Err(Error::MediaUrlError(format!(
                    "unknown media scheme: {}",
                    other
                )))
            }
        };

        let mut url = MediaUrl {
            source,
            duration: None,
            repeat: false,
            append: false,
            silence_time: None,
        };

        for param in parts {
            let (key, value) = match param.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (param, None),
            };
            match (key.to_ascii_lowercase().as_str(), value) {
                ("duration", Some(v)) => {
                    let ms: u64 = v.parse().map_err(|_| {
                        Error::MediaUrlError(format!("bad duration: {}", v))
                    })?;
                    url.duration = Some(Duration::from_millis(ms));
                }
                ("repeat", None) => url.repeat = true,
                ("append", None) => url.append = true,
                ("silencetime", Some(v)) => {
                    let ms: u64 = v.parse().map_err(|_| {
                        Error::MediaUrlError(format!("bad silencetime: {}", v))
                    })?;
                    url.silence_time = Some(Duration::from_millis(ms));
                }
                _ => {
                    return Err(Error::MediaUrlError(format!(
                        "unknown media parameter: {}",
                        param
                    )))
                }
            }
        }

        if url.repeat && !url.is_playback() {
            return Err(Error::MediaUrlError(
                "repeat is only valid for playback".to_string(),
            ));
        }
        if (url.append || url.silence_time.is_some()) && url.is_playback() {
            return Err(Error::MediaUrlError(
                "append/silencetime are only valid for recording".to_string(),
            ));
        }
        Ok(url)
    }
}

/// Codec tag for cached buffers. Raw PCM is the only tag the engine
/// produces itself; playback of WAV/AU goes through the file path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecTag {
    #[default]
    RawPcm16,
    Wav,
    Au,
}

#[derive(Clone)]
pub struct CachedBuffer {
    pub data: Bytes,
    pub codec: CodecTag,
}

/// Named in-memory prompts for `cache:` URLs. Read-mostly; writes take
/// the exclusive lock.
pub struct MediaResourceCache {
    entries: RwLock<HashMap<String, CachedBuffer>>,
}

impl MediaResourceCache {
    pub fn new() -> Self {
        MediaResourceCache {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_buffer(&self, name: &str, data: Bytes, codec: CodecTag) {
        self.entries
            .write()
            .unwrap()
            .insert(name.to_string(), CachedBuffer { data, codec });
    }

    pub fn get_buffer(&self, name: &str) -> Option<CachedBuffer> {
        self.entries.read().unwrap().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> bool {
        self.entries.write().unwrap().remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MediaResourceCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tone_urls() {
        let url: MediaUrl = "tone:ringback".parse().expect("tone url");
        assert_eq!(url.source, MediaSource::Tone(Tone::Ringback));
        assert!(url.is_playback());

        let url: MediaUrl = "tone:5;duration=1000".parse().expect("digit tone");
        assert_eq!(url.source, MediaSource::Tone(Tone::Digit('5')));
        assert_eq!(url.duration, Some(Duration::from_millis(1000)));

        assert!("tone:nope".parse::<MediaUrl>().is_err());
    }

    #[test]
    fn test_file_urls() {
        let url: MediaUrl = "file://prompts/welcome.wav;repeat".parse().expect("file url");
        assert_eq!(
            url.source,
            MediaSource::File(PathBuf::from("prompts/welcome.wav"))
        );
        assert!(url.repeat);

        // drive-letter escape
        let url: MediaUrl = "file:C|/sounds/ring.au".parse().expect("escaped path");
        assert_eq!(url.source, MediaSource::File(PathBuf::from("C:/sounds/ring.au")));

        assert!("file:notes.txt".parse::<MediaUrl>().is_err());
    }

    #[test]
    fn test_record_urls() {
        let url: MediaUrl = "record:call.wav;duration=30000;silencetime=5000"
            .parse()
            .expect("record url");
        assert_eq!(url.source, MediaSource::Record(PathBuf::from("call.wav")));
        assert_eq!(url.silence_time, Some(Duration::from_millis(5000)));
        assert!(!url.is_playback());

        assert!("record:call.wav;repeat".parse::<MediaUrl>().is_err());
        assert!("file:call.wav;append".parse::<MediaUrl>().is_err());
    }

    #[test]
    fn test_cache_round_trip() {
        let cache = MediaResourceCache::new();
        cache.add_buffer("welcome", Bytes::from_static(b"pcm"), CodecTag::RawPcm16);
        let hit = cache.get_buffer("welcome").expect("cached entry");
        assert_eq!(hit.data.as_ref(), b"pcm");
        assert!(cache.get_buffer("missing").is_none());
        assert!(cache.remove("welcome"));
        assert!(cache.is_empty());
    }
}
