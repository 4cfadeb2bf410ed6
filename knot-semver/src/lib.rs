use semver::VersionReq;
use std::error::Error as StdError;
use std::fmt;

pub use semver::Version;

/// A parsed npm-style range: one or more `||`-separated alternatives,
/// any of which may satisfy the set.
#[derive(Debug, Clone)]
pub struct RangeSet {
    original: String,
    alternatives: Vec<VersionReq>,
}

#[derive(Debug, Clone)]
pub struct Error {
    input: String,
    message: String,
}

impl Error {
    pub fn new(input: String, message: String) -> Self {
        Self { input, message }
    }

    pub fn input(&self) -> &str {
        &self.input
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.input)
    }
}

impl StdError for Error {}

impl RangeSet {
    pub fn parse(original: &str) -> Result<Self, Error> {
        let mut trimmed = original.trim();

        if trimmed.is_empty() || trimmed == "latest" {
            trimmed = "*";
        }

        let mut alternatives = Vec::new();

        for part in trimmed.split("||") {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let normalized = normalize_alternative(part);

            let req = VersionReq::parse(&normalized)
                .map_err(|err| Error::new(original.to_string(), err.to_string()))?;

            alternatives.push(req);
        }

        if alternatives.is_empty() {
            let req = VersionReq::parse("*")
                .map_err(|err| Error::new(original.to_string(), err.to_string()))?;
            alternatives.push(req);
        }

        Ok(RangeSet {
            original: original.to_string(),
            alternatives,
        })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    /// Picks the highest version in `versions` that satisfies the set.
    pub fn max_satisfying<'a, I>(&self, versions: I) -> Option<Version>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut best: Option<Version> = None;

        for candidate in versions {
            let Ok(version) = Version::parse(candidate) else {
                continue;
            };

            if !self.matches(&version) {
                continue;
            }

            match &best {
                Some(current) if version <= *current => {}
                _ => best = Some(version),
            }
        }

        best
    }
}

/// Checks whether `range` is a plausible semver range at all. Used to
/// distinguish bare ranges from protocol-qualified requests.
pub fn is_valid_range(range: &str) -> bool {
    RangeSet::parse(range).is_ok()
}

/// The `semver` crate wants comma-separated comparators while npm ranges
/// separate them with spaces. Rewrites `>=1.0.0 <2.0.0` into
/// `>=1.0.0, <2.0.0`, leaving hyphen ranges and single comparators alone.
fn normalize_alternative(part: &str) -> String {
    let tokens: Vec<&str> = part.split_whitespace().collect();

    if tokens.len() <= 1 {
        return part.to_string();
    }

    if tokens.len() == 3 && tokens[1] == "-" {
        return part.to_string();
    }

    let mut result = String::new();

    for (index, token) in tokens.iter().enumerate() {
        if index > 0 {
            let previous = tokens[index - 1];
            if matches!(previous, "=" | ">" | ">=" | "<" | "<=" | "~" | "^") {
                result.push(' ');
            } else {
                result.push_str(", ");
            }
        }

        result.push_str(token);
    }

    result
}
