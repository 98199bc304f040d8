//! Freshness tags and canonical cache keys.
//!
//! A [`Tag`] travels with every cacheable document and answers two questions:
//! did the underlying source change since the last fetch, and until when may
//! the stored copy be served. A [`TagKey`] is the string identity under which
//! a tagged document is stored.

use std::{fmt, time::Duration};

use time::{OffsetDateTime, PrimitiveDateTime};

/// `now + span`, clamped to the latest representable instant.
pub fn saturating_after(now: OffsetDateTime, span: Duration) -> OffsetDateTime {
    time::Duration::try_from(span)
        .ok()
        .and_then(|span| now.checked_add(span))
        .unwrap_or_else(|| PrimitiveDateTime::MAX.assume_utc())
}

/// Freshness metadata attached to a cached document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tag {
    /// `false` only when the producer confirmed the cached copy is still current.
    pub modified: bool,
    pub last_modified: Option<OffsetDateTime>,
    pub expire_time: Option<OffsetDateTime>,
}

impl Tag {
    /// Tag for a full fetch: always reports a modification.
    pub fn fresh(
        last_modified: Option<OffsetDateTime>,
        expire_time: Option<OffsetDateTime>,
    ) -> Self {
        Self {
            modified: true,
            last_modified,
            expire_time,
        }
    }

    /// Combine the previously stored tag with a modification-time probe.
    ///
    /// When the probe is not newer than the stored `last_modified`, the
    /// previous timestamps are kept and the tag reports `modified = false`.
    pub fn combine(previous: Option<&Tag>, probe: OffsetDateTime) -> Self {
        match previous.and_then(|tag| tag.last_modified.map(|at| (tag, at))) {
            Some((tag, last_modified)) if probe <= last_modified => Self {
                modified: false,
                last_modified: tag.last_modified,
                expire_time: tag.expire_time,
            },
            _ => Self::fresh(Some(probe), None),
        }
    }

    /// Copy of this tag confirming the cached document is still current.
    pub fn unmodified(self) -> Self {
        Self {
            modified: false,
            ..self
        }
    }

    pub fn with_expire_time(self, expire_time: OffsetDateTime) -> Self {
        Self {
            expire_time: Some(expire_time),
            ..self
        }
    }

    /// Set `expire_time` to `now + ttl` when the producer left it open.
    pub fn expire_after_if_unset(self, now: OffsetDateTime, ttl: Duration) -> Self {
        match self.expire_time {
            Some(_) => self,
            None => self.with_expire_time(saturating_after(now, ttl)),
        }
    }

    pub fn expired_at(&self, now: OffsetDateTime) -> bool {
        self.expire_time.is_some_and(|at| at <= now)
    }
}

/// Canonical cache key built from ordered fragments joined by `|`.
///
/// Fragments are escaped so that two different fragment lists can never
/// produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagKey(String);

impl TagKey {
    pub fn from_fragments<I, S>(identity: &str, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        fragments
            .into_iter()
            .fold(TagKeyBuilder::new(identity), |builder, fragment| {
                builder.push(fragment)
            })
            .finish()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TagKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct TagKeyBuilder {
    buf: String,
}

impl TagKeyBuilder {
    /// Start a key with the identity fragment of the producing block or strategy.
    pub fn new(identity: &str) -> Self {
        let mut buf = String::with_capacity(identity.len() + 32);
        escape_into(&mut buf, identity);
        Self { buf }
    }

    pub fn push(mut self, fragment: impl AsRef<str>) -> Self {
        self.buf.push('|');
        escape_into(&mut self.buf, fragment.as_ref());
        self
    }

    pub fn push_time(self, at: Option<OffsetDateTime>) -> Self {
        match at {
            Some(at) => self.push(at.unix_timestamp().to_string()),
            None => self.push(""),
        }
    }

    pub fn finish(self) -> TagKey {
        TagKey(self.buf)
    }
}

fn escape_into(buf: &mut String, fragment: &str) {
    for ch in fragment.chars() {
        if ch == '|' || ch == '\\' {
            buf.push('\\');
        }
        buf.push(ch);
    }
}
