// tests/property/cache_key_test.rs

//! Property-based tests for cache key derivation.

use proptest::prelude::*;
use reqwest::Method;
use std::collections::BTreeMap;
use stride::config::{HandlerKind, PathConfig};
use stride::core::proxy::ProxyRequest;
use stride::core::proxy::key::derive_cache_key;
use url::Url;

fn request(pairs: &[(String, String)]) -> ProxyRequest {
    let mut url = Url::parse("http://origin.test/api/v1/query").unwrap();
    url.query_pairs_mut().extend_pairs(pairs);
    ProxyRequest::new(Method::GET, url)
}

fn params() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::btree_map("[a-z]{1,8}", "[a-zA-Z0-9 ]{0,12}", 1..8)
        .prop_map(|m: BTreeMap<String, String>| m.into_iter().collect::<Vec<_>>())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_key_ignores_parameter_order(
        (ordered, shuffled) in params().prop_flat_map(|p| (Just(p.clone()), Just(p).prop_shuffle()))
    ) {
        let path = PathConfig::new("/api/v1/query", HandlerKind::ProxyCache).with_key_params(&["*"]);
        let a = derive_cache_key(&request(&ordered), Some(&path), None, "");
        let b = derive_cache_key(&request(&shuffled), Some(&path), None, "");
        prop_assert_eq!(a, b);
    }

    #[test]
    fn test_unselected_parameters_do_not_change_the_key(
        base in params(),
        noise in "[a-zA-Z0-9]{1,12}",
    ) {
        let path = PathConfig::new("/api/v1/query", HandlerKind::ProxyCache)
            .with_key_params(&["query"]);
        let mut noisy = base.clone();
        noisy.retain(|(k, _)| k != "zzznoise");
        noisy.push(("zzznoise".to_string(), noise));

        let a = derive_cache_key(&request(&base), Some(&path), None, "");
        let b = derive_cache_key(&request(&noisy), Some(&path), None, "");
        prop_assert_eq!(a, b);
    }

    #[test]
    fn test_key_is_a_sha1_hex_digest(pairs in params(), extra in "[a-z]{0,8}") {
        let path = PathConfig::new("/api/v1/query", HandlerKind::ProxyCache).with_key_params(&["*"]);
        let key = derive_cache_key(&request(&pairs), Some(&path), None, &extra);
        prop_assert_eq!(key.len(), 40);
        prop_assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
