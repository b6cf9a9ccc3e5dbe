/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Schemeful site and origin comparison.
//!
//! The registrable domain is approximated without a public-suffix list: the
//! last two labels, or the last three when the second-level label is one of
//! the common country-code second levels (`co.uk`, `com.au`, ...). IP
//! addresses and single-label hosts are their own site.

use url::{Host, Url};

const CCTLD_SECOND_LEVELS: [&str; 7] = ["ac", "co", "com", "edu", "gov", "net", "org"];

pub fn is_navigable_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

fn registrable_domain(url: &Url) -> Option<String> {
    match url.host()? {
        Host::Ipv4(addr) => Some(addr.to_string()),
        Host::Ipv6(addr) => Some(addr.to_string()),
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            let labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
            let keep = match labels.as_slice() {
                [] => return None,
                [.., second, tld] if tld.len() == 2 && CCTLD_SECOND_LEVELS.contains(second) => 3,
                _ => 2,
            };
            let start = labels.len().saturating_sub(keep);
            Some(labels[start..].join("."))
        }
    }
}

/// Schemeful same-site: equal schemes and equal registrable domains.
pub fn same_site(a: &Url, b: &Url) -> bool {
    if a.scheme() != b.scheme() {
        return false;
    }
    match (registrable_domain(a), registrable_domain(b)) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}

pub fn same_origin(a: &Url, b: &Url) -> bool {
    let (left, right) = (a.origin(), b.origin());
    left.is_tuple() && left == right
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[rstest]
    #[case("https://a.example.com/x", "https://b.example.com/y", true)]
    #[case("https://example.com/", "https://www.example.com/", true)]
    #[case("https://example.com/", "https://example.org/", false)]
    #[case("http://example.com/", "https://example.com/", false)]
    #[case("https://shop.example.co.uk/", "https://www.example.co.uk/", true)]
    #[case("https://one.co.uk/", "https://two.co.uk/", false)]
    #[case("https://127.0.0.1/", "https://127.0.0.1:8443/", true)]
    #[case("https://127.0.0.1/", "https://127.0.0.2/", false)]
    #[case("https://localhost/", "https://localhost:9000/", true)]
    fn same_site_table(#[case] a: &str, #[case] b: &str, #[case] expected: bool) {
        assert_eq!(same_site(&url(a), &url(b)), expected);
    }

    #[test]
    fn same_origin_requires_host_and_port() {
        assert!(same_origin(&url("https://a.test/x"), &url("https://a.test/y?q")));
        assert!(!same_origin(&url("https://a.test/"), &url("https://b.a.test/")));
        assert!(!same_origin(&url("https://a.test/"), &url("https://a.test:444/")));
    }

    #[test]
    fn opaque_origins_are_never_same_origin() {
        let data = url("data:text/plain,hi");
        assert!(!same_origin(&data, &data));
    }

    #[test]
    fn only_http_family_is_navigable() {
        assert!(is_navigable_scheme(&url("https://a.test/")));
        assert!(is_navigable_scheme(&url("http://a.test/")));
        assert!(!is_navigable_scheme(&url("ftp://a.test/")));
        assert!(!is_navigable_scheme(&url("blob:https://a.test/uuid")));
    }
}
