//! Broadcast metadata records and radiotext assembly
//!
//! The metadata decoder emits one JSON object per line
//! whenever it has decoded something. Each object carries
//! whichever fields are available at the moment:
//!
//! ```txt
//! {"pi":"0xF201","ps":"FIP     "}
//! {"pi":"0xF201","partial_radiotext":"Now playin","rt_ab":"A"}
//! {"pi":"0xF201","partial_radiotext":"Now playing: Nina","rt_ab":"A"}
//! {"pi":"0xF201","radiotext":"Now playing: Nina Simone","rt_ab":"A"}
//! ```
//!
//! Radiotext arrives piecemeal. Within one period of the
//! alternating A/B flag, fragments only ever grow. A flip of
//! the flag means the station has started a new text, and
//! the old one is complete.

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Alternating radiotext flag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::EnumString)]
pub enum TextFlag {
    A,
    B,
}

/// One decoded metadata record
///
/// Unknown fields are ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct MetadataRecord {
    /// Station name ("program service")
    #[serde(default)]
    pub ps: Option<String>,

    /// Radiotext fragment, as decoded so far
    #[serde(default)]
    pub partial_radiotext: Option<String>,

    /// Complete radiotext
    #[serde(default)]
    pub radiotext: Option<String>,

    /// Alternating text flag
    ///
    /// A value other than `"A"` or `"B"` is treated as absent,
    /// and the rest of the record is kept.
    #[serde(default, deserialize_with = "lenient_flag")]
    pub rt_ab: Option<TextFlag>,
}

fn lenient_flag<'de, D>(de: D) -> Result<Option<TextFlag>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(de)?;
    Ok(raw
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .and_then(|flag| flag.parse().ok()))
}

/// Error parsing a metadata line
#[derive(Error, Debug)]
pub enum FeedParseErr {
    /// The line is empty or whitespace
    #[error("empty metadata line")]
    Empty,

    /// The line is not a JSON object of the expected shape
    #[error("malformed metadata line: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl MetadataRecord {
    /// Parse one line of the feed
    pub fn parse(line: &str) -> Result<Self, FeedParseErr> {
        let line = line.trim();
        if line.is_empty() {
            return Err(FeedParseErr::Empty);
        }
        Ok(serde_json::from_str(line)?)
    }
}

/// Current station metadata
///
/// Applies [`MetadataRecord`]s in order and maintains a
/// stable station name and radiotext.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataState {
    station_name: String,
    rolling_text: String,
    accumulator: String,
    flag: Option<TextFlag>,
}

/// What changed after applying a record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetadataUpdate {
    /// The record carried a station name
    pub station_name: bool,

    /// The published radiotext was set
    pub rolling_text: bool,
}

impl MetadataState {
    /// Empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Station name; empty until one is received
    pub fn station_name(&self) -> &str {
        &self.station_name
    }

    /// Published radiotext; empty until one is received
    pub fn rolling_text(&self) -> &str {
        &self.rolling_text
    }

    /// Flag of the text currently being assembled
    pub fn flag(&self) -> Option<TextFlag> {
        self.flag
    }

    /// Apply a record
    ///
    /// A station name overwrites the previous one. A radiotext
    /// fragment is merged:
    ///
    /// 1. If its flag differs from the last one seen, the text
    ///    accumulated so far is published and the accumulator
    ///    is cleared.
    /// 2. The flag is recorded. A fragment without a flag
    ///    counts as flag `A`.
    /// 3. If the fragment is non-empty and strictly longer than
    ///    the accumulator, it replaces the accumulator and is
    ///    published. Shorter or duplicate fragments are ignored.
    ///
    /// A complete radiotext is published as-is and becomes
    /// the accumulator for its flag period.
    pub fn apply(&mut self, record: &MetadataRecord) -> MetadataUpdate {
        let mut update = MetadataUpdate::default();

        if let Some(ps) = &record.ps {
            self.station_name = ps.trim().to_owned();
            update.station_name = true;
        }

        if let Some(fragment) = &record.partial_radiotext {
            let flag = record.rt_ab.unwrap_or(TextFlag::A);
            update.rolling_text |= self.flip_to(flag);

            let fragment = fragment.trim();
            if !fragment.is_empty() && fragment.len() > self.accumulator.len() {
                self.accumulator = fragment.to_owned();
                self.rolling_text = fragment.to_owned();
                update.rolling_text = true;
            }
        }

        if let Some(text) = &record.radiotext {
            let text = text.trim();
            if !text.is_empty() {
                if let Some(flag) = record.rt_ab {
                    update.rolling_text |= self.flip_to(flag);
                }
                self.accumulator = text.to_owned();
                self.rolling_text = text.to_owned();
                update.rolling_text = true;
            }
        }

        update
    }

    /// Overwrite the station name
    pub fn set_station_name(&mut self, name: &str) {
        self.station_name = name.trim().to_owned();
    }

    /// Publish `text` if it is longer than the current radiotext
    ///
    /// Used for results of a one-shot read, which may have seen
    /// more of the text than the background reader. Returns
    /// true if `text` was published.
    pub fn offer_rolling_text(&mut self, text: &str) -> bool {
        let text = text.trim();
        if text.len() > self.rolling_text.len() {
            self.rolling_text = text.to_owned();
            true
        } else {
            false
        }
    }

    // Record `flag`, finalizing the previous text on a flip
    fn flip_to(&mut self, flag: TextFlag) -> bool {
        let flipped = matches!(self.flag, Some(prev) if prev != flag);
        if flipped {
            self.rolling_text = self.accumulator.trim().to_owned();
            self.accumulator.clear();
        }
        self.flag = Some(flag);
        flipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(text: &str, flag: TextFlag) -> MetadataRecord {
        MetadataRecord {
            partial_radiotext: Some(text.to_owned()),
            rt_ab: Some(flag),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse() {
        let rec = MetadataRecord::parse(
            r#"{"pi":"0xF201","group":"2A","ps":"FIP     ","partial_radiotext":"Hel","rt_ab":"B"}"#,
        )
        .expect("parse");
        assert_eq!(rec.ps.as_deref(), Some("FIP     "));
        assert_eq!(rec.partial_radiotext.as_deref(), Some("Hel"));
        assert_eq!(rec.rt_ab, Some(TextFlag::B));
        assert_eq!(rec.radiotext, None);

        let rec = MetadataRecord::parse("{\"pi\":\"0xF201\"}\n").expect("parse");
        assert_eq!(rec, MetadataRecord::default());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(MetadataRecord::parse("  "), Err(FeedParseErr::Empty)));
        assert!(matches!(
            MetadataRecord::parse("{\"ps\": \"FIP"),
            Err(FeedParseErr::Malformed(_))
        ));
        assert!(MetadataRecord::parse("[1, 2, 3]").is_err());
    }

    #[test]
    fn test_parse_odd_flag() {
        let rec = MetadataRecord::parse(r#"{"ps":"FIP","rt_ab":"C"}"#).expect("parse");
        assert_eq!(rec.ps.as_deref(), Some("FIP"));
        assert_eq!(rec.rt_ab, None);

        let rec = MetadataRecord::parse(r#"{"partial_radiotext":"Hi","rt_ab":1}"#).expect("parse");
        assert_eq!(rec.partial_radiotext.as_deref(), Some("Hi"));
        assert_eq!(rec.rt_ab, None);

        let mut st = MetadataState::new();
        assert!(st.apply(&rec).rolling_text);
        assert_eq!(st.rolling_text(), "Hi");
    }

    #[test]
    fn test_station_name() {
        let mut st = MetadataState::new();
        let upd = st.apply(&MetadataRecord {
            ps: Some(" RADIO 1 ".to_owned()),
            ..Default::default()
        });
        assert!(upd.station_name);
        assert!(!upd.rolling_text);
        assert_eq!(st.station_name(), "RADIO 1");
    }

    #[test]
    fn test_fragments_grow() {
        let mut st = MetadataState::new();
        st.apply(&fragment("Hel", TextFlag::A));
        assert_eq!(st.rolling_text(), "Hel");
        st.apply(&fragment("Hello", TextFlag::A));
        assert_eq!(st.rolling_text(), "Hello");

        // shorter and duplicate fragments are ignored
        let upd = st.apply(&fragment("He", TextFlag::A));
        assert!(!upd.rolling_text);
        st.apply(&fragment("Hello", TextFlag::A));
        assert_eq!(st.rolling_text(), "Hello");

        // empty fragments too
        st.apply(&fragment("   ", TextFlag::A));
        assert_eq!(st.rolling_text(), "Hello");
    }

    #[test]
    fn test_flag_flip_finalizes() {
        let mut st = MetadataState::new();
        st.apply(&fragment("Hel", TextFlag::A));
        st.apply(&fragment("Hello", TextFlag::A));

        // flip with a fragment that is too short to publish:
        // the previous text is finalized and accumulation restarts
        let upd = st.apply(&fragment("", TextFlag::B));
        assert!(upd.rolling_text);
        assert_eq!(st.rolling_text(), "Hello");
        assert_eq!(st.flag(), Some(TextFlag::B));

        // fresh accumulation: "Wo" is longer than the empty accumulator
        st.apply(&fragment("Wo", TextFlag::B));
        assert_eq!(st.rolling_text(), "Wo");
        st.apply(&fragment("World", TextFlag::B));
        assert_eq!(st.rolling_text(), "World");
    }

    #[test]
    fn test_flip_allows_shorter_text() {
        let mut st = MetadataState::new();
        st.apply(&fragment("A long first radiotext", TextFlag::A));
        st.apply(&fragment("Short", TextFlag::B));
        assert_eq!(st.rolling_text(), "Short");
    }

    #[test]
    fn test_missing_flag_is_a() {
        let mut st = MetadataState::new();
        st.apply(&MetadataRecord {
            partial_radiotext: Some("abc".to_owned()),
            ..Default::default()
        });
        assert_eq!(st.flag(), Some(TextFlag::A));
        st.apply(&fragment("x", TextFlag::B));
        assert_eq!(st.rolling_text(), "x");
    }

    #[test]
    fn test_full_radiotext() {
        let mut st = MetadataState::new();
        st.apply(&fragment("Now play", TextFlag::A));
        st.apply(&MetadataRecord {
            radiotext: Some("Now playing: Nina Simone".to_owned()),
            rt_ab: Some(TextFlag::A),
            ..Default::default()
        });
        assert_eq!(st.rolling_text(), "Now playing: Nina Simone");

        // a late, shorter fragment does not clobber it
        st.apply(&fragment("Now playing", TextFlag::A));
        assert_eq!(st.rolling_text(), "Now playing: Nina Simone");
    }

    #[test]
    fn test_offer_rolling_text() {
        let mut st = MetadataState::new();
        st.apply(&fragment("Now", TextFlag::A));
        assert!(st.offer_rolling_text("Now playing"));
        assert!(!st.offer_rolling_text("No"));
        assert_eq!(st.rolling_text(), "Now playing");
    }
}
