use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use regex::Regex;

use super::{Error, Result};
use crate::alarm::{self, AlarmType};

/// Include/exclude predicate over a string map such as container labels or env variables.
///
/// Values starting with `^` are regexes; other values are literals, where an empty literal matches
/// any value of the key.
#[derive(Debug, Clone, Default)]
pub struct LabelMatcher {
    include: Vec<(String, String)>,
    include_regex: Vec<(String, Regex)>,
    exclude: Vec<(String, String)>,
    exclude_regex: Vec<(String, Regex)>,
}

impl LabelMatcher {
    /// Compiles the include and exclude maps.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRegex`] naming the first key whose regex does not compile.
    pub fn new(include: &HashMap<String, String>, exclude: &HashMap<String, String>) -> Result<Self> {
        let (include, include_regex) = split(include)?;
        let (exclude, exclude_regex) = split(exclude)?;
        Ok(Self {
            include,
            include_regex,
            exclude,
            exclude_regex,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty()
            && self.include_regex.is_empty()
            && self.exclude.is_empty()
            && self.exclude_regex.is_empty()
    }

    /// Returns true if at least one include entry matches (or there are none) and no exclude entry
    /// matches.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        let literal = |(key, want): &(String, String)| {
            labels
                .get(key)
                .is_some_and(|value| want.is_empty() || value == want)
        };
        let pattern = |(key, regex): &(String, Regex)| {
            labels.get(key).is_some_and(|value| regex.is_match(value))
        };

        if !(self.include.is_empty() && self.include_regex.is_empty())
            && !self.include.iter().any(literal)
            && !self.include_regex.iter().any(pattern)
        {
            return false;
        }
        !self.exclude.iter().any(literal) && !self.exclude_regex.iter().any(pattern)
    }
}

impl Hash for LabelMatcher {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for (literals, regexes) in [
            (&self.include, &self.include_regex),
            (&self.exclude, &self.exclude_regex),
        ] {
            for (key, value) in literals {
                key.hash(state);
                value.hash(state);
            }
            for (key, regex) in regexes {
                key.hash(state);
                regex.as_str().hash(state);
            }
            "$$$".hash(state);
        }
    }
}

type Split = (Vec<(String, String)>, Vec<(String, Regex)>);

fn split(map: &HashMap<String, String>) -> Result<Split> {
    let mut literals = Vec::new();
    let mut regexes = Vec::new();
    for (key, value) in map {
        if value.starts_with('^') {
            let regex = Regex::new(value).map_err(|source| {
                alarm::raise(
                    AlarmType::InvalidRegex,
                    format_args!("invalid regex `{value}` for key `{key}`: {source}"),
                );
                Error::InvalidRegex {
                    key: key.clone(),
                    pattern: value.clone(),
                    source: Box::new(source),
                }
            })?;
            regexes.push((key.clone(), regex));
        } else {
            literals.push((key.clone(), value.clone()));
        }
    }
    // Sorted so that equal maps hash equally.
    literals.sort();
    regexes.sort_by(|a, b| a.0.cmp(&b.0));
    Ok((literals, regexes))
}
