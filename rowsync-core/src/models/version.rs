use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum VersionError {
    #[error("malformed state version: {0}")]
    MalformedState(String),
    #[error("malformed cvr version: {0}")]
    MalformedCvr(String),
    #[error("state version may not move backwards: {current} -> {next}")]
    NonMonotonic { current: String, next: String },
}

/// Lexicographically sortable token labelling a consistent upstream snapshot.
///
/// The canonical encoding of an unsigned sequence number is length-prefixed
/// base-36: one prefix character (`'a'` for one digit, `'b'` for two, ...)
/// followed by the lowercase base-36 digits. Under this encoding lexicographic
/// order on the token coincides with numeric order on the sequence for all
/// `u64` values, which is what makes the token usable as a sort key both in
/// memory and in the database.
///
/// The empty token is the distinguished minimum and precedes every encoded
/// version.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVersion(String);

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

impl StateVersion {
    /// The distinguished minimum, preceding all encoded versions.
    pub fn min() -> Self {
        StateVersion(String::new())
    }

    pub fn is_min(&self) -> bool {
        self.0.is_empty()
    }

    /// Encodes an upstream sequence number as a sortable token.
    pub fn from_sequence(seq: u64) -> Self {
        let mut digits = Vec::new();
        let mut rest = seq;
        loop {
            digits.push(BASE36[(rest % 36) as usize]);
            rest /= 36;
            if rest == 0 {
                break;
            }
        }
        let mut out = String::with_capacity(digits.len() + 1);
        out.push((b'a' + (digits.len() - 1) as u8) as char);
        digits.reverse();
        out.push_str(std::str::from_utf8(&digits).expect("base36 digits are ascii"));
        StateVersion(out)
    }

    /// Decodes the token back into its sequence number. Returns `None` for
    /// the minimum version.
    pub fn to_sequence(&self) -> Option<u64> {
        if self.is_min() {
            return None;
        }
        let digits = &self.0.as_bytes()[1..];
        let mut seq: u64 = 0;
        for d in digits {
            let val = match d {
                b'0'..=b'9' => (d - b'0') as u64,
                b'a'..=b'z' => (d - b'a' + 10) as u64,
                _ => unreachable!("validated on construction"),
            };
            seq = seq * 36 + val;
        }
        Some(seq)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), VersionError> {
        if s.is_empty() {
            return Ok(());
        }
        let bytes = s.as_bytes();
        let prefix = bytes[0];
        if !prefix.is_ascii_lowercase() {
            return Err(VersionError::MalformedState(s.to_owned()));
        }
        let expected_digits = (prefix - b'a') as usize + 1;
        if bytes.len() != expected_digits + 1 {
            return Err(VersionError::MalformedState(s.to_owned()));
        }
        if !bytes[1..]
            .iter()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
        {
            return Err(VersionError::MalformedState(s.to_owned()));
        }
        Ok(())
    }
}

impl FromStr for StateVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::validate(s)?;
        Ok(StateVersion(s.to_owned()))
    }
}

impl fmt::Display for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_min() {
            f.write_str("StateVersion(MIN)")
        } else {
            write!(f, "StateVersion({})", self.0)
        }
    }
}

/// Version of a client view record.
///
/// Advances on every flush that changes externally visible state: the state
/// version follows the upstream replica, while the minor version counts
/// configuration-only changes in between upstream advances. The derived `Ord`
/// is lexicographic on the state version, then numeric on the minor version,
/// exactly the ordering required of CVR versions.
#[derive(
    Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug,
)]
pub struct CvrVersion {
    pub state_version: StateVersion,
    pub minor_version: u32,
}

impl CvrVersion {
    /// The minimum version, held by freshly created CVRs.
    pub fn min() -> Self {
        CvrVersion::default()
    }

    pub fn is_min(&self) -> bool {
        self.state_version.is_min() && self.minor_version == 0
    }

    pub fn new(state_version: StateVersion, minor_version: u32) -> Self {
        CvrVersion { state_version, minor_version }
    }

    /// The next configuration-only version at the same state version.
    pub fn next_minor(&self) -> Self {
        CvrVersion {
            state_version: self.state_version.clone(),
            minor_version: self.minor_version + 1,
        }
    }

    /// Advances to a new state version, resetting the minor counter.
    ///
    /// The new state version must not precede the current one; versions are
    /// monotone across the lifetime of a CVR.
    pub fn advance(&self, state_version: StateVersion) -> Result<Self, VersionError> {
        if state_version < self.state_version {
            return Err(VersionError::NonMonotonic {
                current: self.state_version.to_string(),
                next: state_version.to_string(),
            });
        }
        Ok(CvrVersion { state_version, minor_version: 0 })
    }

    pub fn max(self, other: Self) -> Self {
        std::cmp::max(self, other)
    }
}

/// Cookie rendering: the bare state version when the minor version is zero,
/// otherwise `<state>:<minor>` with the minor encoded like a state version so
/// the rendered cookies themselves sort lexicographically.
impl fmt::Display for CvrVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minor_version == 0 {
            write!(f, "{}", self.state_version)
        } else {
            write!(
                f,
                "{}:{}",
                self.state_version,
                StateVersion::from_sequence(self.minor_version as u64)
            )
        }
    }
}

impl FromStr for CvrVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None => Ok(CvrVersion { state_version: s.parse()?, minor_version: 0 }),
            Some((state, minor)) => {
                let minor: StateVersion = minor
                    .parse()
                    .map_err(|_| VersionError::MalformedCvr(s.to_owned()))?;
                let minor = minor
                    .to_sequence()
                    .filter(|m| *m > 0 && *m <= u32::MAX as u64)
                    .ok_or_else(|| VersionError::MalformedCvr(s.to_owned()))?;
                Ok(CvrVersion { state_version: state.parse()?, minor_version: minor as u32 })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, "a0")]
    #[case(9, "a9")]
    #[case(10, "aa")]
    #[case(35, "az")]
    #[case(36, "b10")]
    #[case(1295, "bzz")]
    #[case(1296, "c100")]
    fn test_state_version_encoding(#[case] seq: u64, #[case] expected: &str) {
        let v = StateVersion::from_sequence(seq);

        assert_eq!(v.as_str(), expected);
        assert_eq!(v.to_sequence(), Some(seq));
    }

    #[test]
    fn test_state_version_order_matches_sequence_order() {
        let interesting =
            [0u64, 1, 35, 36, 37, 1295, 1296, 46655, 46656, u32::MAX as u64, u64::MAX];
        for a in interesting {
            for b in interesting {
                let (va, vb) = (StateVersion::from_sequence(a), StateVersion::from_sequence(b));
                assert_eq!(va.cmp(&vb), a.cmp(&b), "ordering diverged for {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_min_precedes_everything() {
        assert!(StateVersion::min() < StateVersion::from_sequence(0));
        assert!(CvrVersion::min() < CvrVersion::new(StateVersion::from_sequence(0), 0));
        assert!(CvrVersion::min().is_min());
        assert_eq!(StateVersion::min().to_sequence(), None);
    }

    #[test]
    fn test_cvr_version_ordering() {
        let v0 = CvrVersion::new(StateVersion::from_sequence(5), 0);
        let v1 = v0.next_minor();
        let v2 = v1.next_minor();
        let advanced = v2
            .advance(StateVersion::from_sequence(6))
            .unwrap();

        assert!(v0 < v1);
        assert!(v1 < v2);
        assert!(v2 < advanced);
        assert_eq!(advanced.minor_version, 0);
        assert_eq!(v0.clone().max(v2.clone()), v2);
    }

    #[test]
    fn test_advance_rejects_regression() {
        let v = CvrVersion::new(StateVersion::from_sequence(9), 3);

        let res = v.advance(StateVersion::from_sequence(8));

        assert!(matches!(res, Err(VersionError::NonMonotonic { .. })));
    }

    #[rstest]
    #[case(CvrVersion::min(), "")]
    #[case(CvrVersion::new(StateVersion::from_sequence(123), 0), "b3f")]
    #[case(CvrVersion::new(StateVersion::from_sequence(123), 1), "b3f:a1")]
    #[case(CvrVersion::new(StateVersion::from_sequence(123), 36), "b3f:b10")]
    fn test_cookie_round_trip(#[case] version: CvrVersion, #[case] cookie: &str) {
        assert_eq!(version.to_string(), cookie);
        assert_eq!(cookie.parse::<CvrVersion>().unwrap(), version);
    }

    #[test]
    fn test_cookie_strings_sort_like_versions() {
        let versions = [
            CvrVersion::min(),
            CvrVersion::new(StateVersion::from_sequence(35), 0),
            CvrVersion::new(StateVersion::from_sequence(35), 2),
            CvrVersion::new(StateVersion::from_sequence(35), 40),
            CvrVersion::new(StateVersion::from_sequence(36), 0),
            CvrVersion::new(StateVersion::from_sequence(1295), 7),
            CvrVersion::new(StateVersion::from_sequence(1296), 0),
        ];
        for pair in versions.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(
                pair[0].to_string() < pair[1].to_string(),
                "cookie order diverged: {} vs {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[rstest]
    #[case("A0")]
    #[case("b1")]
    #[case("a12")]
    #[case("a0:")]
    #[case("a0:a0")]
    fn test_rejects_malformed(#[case] raw: &str) {
        assert!(raw.parse::<CvrVersion>().is_err());
    }
}
