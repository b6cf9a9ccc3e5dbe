/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `No-Vary-Search` equivalence over query parameters.
//!
//! The same value type serves two roles: the candidate's url-match hint
//! (a promise that lets matching start before headers arrive) and the
//! authoritative response header that confirms or refutes it.
//!
//! Accepted syntax is the structured-field dictionary subset used in
//! practice:
//!
//! ```text
//! key-order
//! params
//! params=("utm_source" "utm_medium")
//! params, except=("q")
//! key-order, params=?0
//! ```
//!
//! Unknown dictionary keys are ignored.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum VaryParams {
    /// Listed parameters are ignored; every other parameter must match.
    Ignore(BTreeSet<String>),
    /// Every parameter is ignored except the listed ones.
    IgnoreAllExcept(BTreeSet<String>),
}

impl Default for VaryParams {
    fn default() -> Self {
        VaryParams::Ignore(BTreeSet::new())
    }
}

impl VaryParams {
    fn is_significant(&self, name: &str) -> bool {
        match self {
            VaryParams::Ignore(ignored) => !ignored.contains(name),
            VaryParams::IgnoreAllExcept(kept) => kept.contains(name),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NoVarySearch {
    /// `key-order`: parameter order does not affect equivalence.
    pub ignore_key_order: bool,
    pub params: VaryParams,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NoVarySearchParseError {
    Empty,
    Malformed { member: String },
    ExceptWithoutParams,
}

impl fmt::Display for NoVarySearchParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty No-Vary-Search value"),
            Self::Malformed { member } => {
                write!(f, "malformed No-Vary-Search member '{member}'")
            }
            Self::ExceptWithoutParams => {
                write!(f, "No-Vary-Search 'except' requires 'params' to be true")
            }
        }
    }
}

impl std::error::Error for NoVarySearchParseError {}

fn parse_boolean(raw: &str, member: &str) -> Result<bool, NoVarySearchParseError> {
    match raw {
        "?1" => Ok(true),
        "?0" => Ok(false),
        _ => Err(NoVarySearchParseError::Malformed {
            member: member.to_string(),
        }),
    }
}

fn parse_inner_list(raw: &str, member: &str) -> Result<BTreeSet<String>, NoVarySearchParseError> {
    let malformed = || NoVarySearchParseError::Malformed {
        member: member.to_string(),
    };
    let inner = raw
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(malformed)?;
    inner
        .split_whitespace()
        .map(|item| {
            item.strip_prefix('"')
                .and_then(|rest| rest.strip_suffix('"'))
                .map(|name| name.replace("\\\"", "\""))
                .ok_or_else(malformed)
        })
        .collect()
}

impl NoVarySearch {
    pub fn parse(value: &str) -> Result<Self, NoVarySearchParseError> {
        if value.trim().is_empty() {
            return Err(NoVarySearchParseError::Empty);
        }

        let mut ignore_key_order = false;
        let mut params_all = false;
        let mut listed: Option<BTreeSet<String>> = None;
        let mut except: Option<BTreeSet<String>> = None;

        for member in value.split(',').map(str::trim).filter(|m| !m.is_empty()) {
            let (key, raw) = match member.split_once('=') {
                Some((key, raw)) => (key.trim(), Some(raw.trim())),
                None => (member, None),
            };
            match (key, raw) {
                ("key-order", None) => ignore_key_order = true,
                ("key-order", Some(raw)) => ignore_key_order = parse_boolean(raw, member)?,
                ("params", None) => params_all = true,
                ("params", Some(raw)) if raw.starts_with('(') => {
                    listed = Some(parse_inner_list(raw, member)?);
                    params_all = false;
                }
                ("params", Some(raw)) => {
                    params_all = parse_boolean(raw, member)?;
                    listed = None;
                }
                ("except", Some(raw)) => except = Some(parse_inner_list(raw, member)?),
                ("except", None) => {
                    return Err(NoVarySearchParseError::Malformed {
                        member: member.to_string(),
                    });
                }
                _ => {}
            }
        }

        let params = match (params_all, except, listed) {
            (true, except, _) => VaryParams::IgnoreAllExcept(except.unwrap_or_default()),
            (false, Some(_), _) => return Err(NoVarySearchParseError::ExceptWithoutParams),
            (false, None, listed) => VaryParams::Ignore(listed.unwrap_or_default()),
        };

        Ok(Self {
            ignore_key_order,
            params,
        })
    }

    fn normalized_pairs(&self, url: &Url) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(name, _)| self.params.is_significant(name))
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        if self.ignore_key_order {
            // Stable: values for a repeated key keep their relative order.
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
        }
        pairs
    }

    /// Whether `a` and `b` identify the same resource under this relation.
    /// Fragments never participate.
    pub fn equivalent(&self, a: &Url, b: &Url) -> bool {
        a.scheme() == b.scheme()
            && a.username() == b.username()
            && a.password() == b.password()
            && a.host_str() == b.host_str()
            && a.port_or_known_default() == b.port_or_known_default()
            && a.path() == b.path()
            && self.normalized_pairs(a) == self.normalized_pairs(b)
    }

    pub fn to_header_value(&self) -> String {
        let quote = |names: &BTreeSet<String>| {
            names
                .iter()
                .map(|n| format!("\"{n}\""))
                .collect::<Vec<_>>()
                .join(" ")
        };
        let mut members = Vec::new();
        if self.ignore_key_order {
            members.push("key-order".to_string());
        }
        match &self.params {
            VaryParams::Ignore(names) if names.is_empty() => {}
            VaryParams::Ignore(names) => members.push(format!("params=({})", quote(names))),
            VaryParams::IgnoreAllExcept(names) if names.is_empty() => {
                members.push("params".to_string())
            }
            VaryParams::IgnoreAllExcept(names) => {
                members.push("params".to_string());
                members.push(format!("except=({})", quote(names)));
            }
        }
        if members.is_empty() {
            "params=?0".to_string()
        } else {
            members.join(", ")
        }
    }
}

impl TryFrom<String> for NoVarySearch {
    type Error = NoVarySearchParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        NoVarySearch::parse(&value)
    }
}

impl From<NoVarySearch> for String {
    fn from(value: NoVarySearch) -> Self {
        value.to_header_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_params_with_except() {
        let nvs = NoVarySearch::parse(r#"key-order, params, except=("q")"#).unwrap();
        assert!(nvs.ignore_key_order);
        assert_eq!(nvs.params, VaryParams::IgnoreAllExcept(names(&["q"])));
    }

    #[test]
    fn parses_listed_params() {
        let nvs = NoVarySearch::parse(r#"params=("utm_source" "utm_medium")"#).unwrap();
        assert!(!nvs.ignore_key_order);
        assert_eq!(
            nvs.params,
            VaryParams::Ignore(names(&["utm_medium", "utm_source"]))
        );
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    fn rejects_empty(#[case] raw: &str) {
        assert_eq!(NoVarySearch::parse(raw), Err(NoVarySearchParseError::Empty));
    }

    #[test]
    fn rejects_except_without_params() {
        assert_eq!(
            NoVarySearch::parse(r#"except=("q")"#),
            Err(NoVarySearchParseError::ExceptWithoutParams)
        );
    }

    #[test]
    fn rejects_unquoted_inner_list_items() {
        assert!(matches!(
            NoVarySearch::parse("params=(a b)"),
            Err(NoVarySearchParseError::Malformed { .. })
        ));
    }

    #[test]
    fn unknown_members_are_ignored() {
        let nvs = NoVarySearch::parse("future-thing=?1, key-order").unwrap();
        assert!(nvs.ignore_key_order);
        assert_eq!(nvs.params, VaryParams::default());
    }

    #[rstest]
    #[case(r#"params, except=("q")"#, "https://s.test/search?q=a&ref=1", "https://s.test/search?q=a&ref=2", true)]
    #[case(r#"params, except=("q")"#, "https://s.test/search?q=a", "https://s.test/search?q=b", false)]
    #[case(r#"params=("ref")"#, "https://s.test/p?id=1&ref=x", "https://s.test/p?id=1", true)]
    #[case(r#"params=("ref")"#, "https://s.test/p?id=1&ref=x", "https://s.test/p?id=2&ref=x", false)]
    #[case("key-order", "https://s.test/p?a=1&b=2", "https://s.test/p?b=2&a=1", true)]
    #[case("params=?0", "https://s.test/p?a=1&b=2", "https://s.test/p?b=2&a=1", false)]
    #[case("params", "https://s.test/p?a=1", "https://s.test/other?a=1", false)]
    #[case("params", "https://s.test/p?a=1#top", "https://s.test/p", true)]
    fn equivalence_table(
        #[case] header: &str,
        #[case] a: &str,
        #[case] b: &str,
        #[case] expected: bool,
    ) {
        let nvs = NoVarySearch::parse(header).unwrap();
        assert_eq!(nvs.equivalent(&url(a), &url(b)), expected);
    }

    #[test]
    fn key_order_keeps_relative_order_of_repeated_keys() {
        let nvs = NoVarySearch::parse("key-order").unwrap();
        assert!(nvs.equivalent(
            &url("https://s.test/?a=1&b=0&a=2"),
            &url("https://s.test/?b=0&a=1&a=2")
        ));
        assert!(!nvs.equivalent(
            &url("https://s.test/?a=1&a=2"),
            &url("https://s.test/?a=2&a=1")
        ));
    }

    #[test]
    fn header_value_reparses_to_same_relation() {
        let nvs = NoVarySearch::parse(r#"key-order, params, except=("q" "lang")"#).unwrap();
        let reparsed = NoVarySearch::parse(&nvs.to_header_value()).unwrap();
        assert_eq!(nvs, reparsed);
    }

    proptest! {
        #[test]
        fn equivalence_is_reflexive(query in "[a-c]=[0-9]{1,2}(&[a-c]=[0-9]{1,2}){0,4}") {
            let target = url(&format!("https://s.test/p?{query}"));
            for header in ["key-order", "params", r#"params=("a")"#, r#"params, except=("b")"#] {
                let nvs = NoVarySearch::parse(header).unwrap();
                prop_assert!(nvs.equivalent(&target, &target));
            }
        }
    }
}
