use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rand::Rng;

pub(crate) const COOKIE_SIZE: usize = 32;

/// RFC 4960 Sec 5.1.3 Valid.Cookie.Life, the suggested 60 seconds.
pub(crate) const VALID_COOKIE_LIFE: Duration = Duration::from_millis(60_000);

/// One locally issued state cookie. The store is a plaintext list of
/// random cookies rather than a stateless signed blob; the association
/// only ever issues a handful before it is established.
#[derive(Debug, Clone)]
pub(crate) struct CookieHolder {
    pub(crate) cookie: Bytes,
    pub(crate) issued_at: Instant,
}

/// Outcome of validating an echoed cookie against the jar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CookieCheck {
    Valid,
    /// Matched a cookie that outlived its lifetime; carries the overflow
    /// in microseconds for the Stale Cookie Error measure.
    Stale { staleness_us: u32 },
    Unknown,
}

/// Remembers every cookie handed out in INIT ACKs until one of them is
/// echoed back and the association establishes.
#[derive(Debug, Default)]
pub(crate) struct CookieJar {
    pub(crate) issued: Vec<CookieHolder>,
}

impl CookieJar {
    /// Generates a fresh random cookie and remembers it.
    pub(crate) fn issue(&mut self) -> Bytes {
        let mut cookie = BytesMut::new();
        cookie.resize(COOKIE_SIZE, 0);
        rand::thread_rng().fill(cookie.as_mut());
        let cookie = cookie.freeze();

        self.issued.push(CookieHolder {
            cookie: cookie.clone(),
            issued_at: Instant::now(),
        });

        cookie
    }

    /// Validates an echoed cookie by exact byte equality and age.
    pub(crate) fn check(&self, echoed: &Bytes) -> CookieCheck {
        for holder in &self.issued {
            if holder.cookie != *echoed {
                continue;
            }
            let age = holder.issued_at.elapsed();
            if age <= VALID_COOKIE_LIFE {
                return CookieCheck::Valid;
            }
            let staleness = age - VALID_COOKIE_LIFE;
            return CookieCheck::Stale {
                staleness_us: staleness.as_micros().min(u32::MAX as u128) as u32,
            };
        }

        CookieCheck::Unknown
    }

    /// Drops everything except the matched cookie. Once the association is
    /// established a single cookie survives, keeping replayed COOKIE ECHOs
    /// answerable.
    pub(crate) fn retain_only(&mut self, echoed: &Bytes) {
        self.issued.retain(|holder| holder.cookie == *echoed);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.issued.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_issue_and_check() {
        let mut jar = CookieJar::default();
        assert!(jar.is_empty());

        let c1 = jar.issue();
        let c2 = jar.issue();
        assert_eq!(c1.len(), COOKIE_SIZE);
        assert_ne!(c1, c2, "cookies should be random");

        assert_eq!(jar.check(&c1), CookieCheck::Valid);
        assert_eq!(jar.check(&c2), CookieCheck::Valid);
        assert_eq!(
            jar.check(&Bytes::from_static(&[0u8; COOKIE_SIZE])),
            CookieCheck::Unknown
        );
    }

    #[test]
    fn test_retain_only_survivor() {
        let mut jar = CookieJar::default();
        let c1 = jar.issue();
        let c2 = jar.issue();

        jar.retain_only(&c2);
        assert_eq!(jar.check(&c1), CookieCheck::Unknown);
        assert_eq!(jar.check(&c2), CookieCheck::Valid);
    }

    #[test]
    fn test_stale_cookie() {
        let mut jar = CookieJar::default();
        let cookie = jar.issue();
        jar.issued[0].issued_at = Instant::now() - VALID_COOKIE_LIFE - Duration::from_millis(5);

        match jar.check(&cookie) {
            CookieCheck::Stale { staleness_us } => {
                assert!(staleness_us >= 5_000, "staleness should be at least 5 ms");
            }
            other => panic!("expected stale cookie, got {other:?}"),
        }
    }
}
