use proptest::prelude::*;

use minimega_ranges::{split_list, unsplit_list};

proptest! {
    #[test]
    fn unsplit_then_split_is_identity_as_multisets(
        hosts in proptest::collection::vec("(kn|ra|node)[0-9]{1,3}(\\.lan)?", 1..40),
    ) {
        let expr = unsplit_list(&hosts);

        let mut expanded = split_list(&expr).unwrap();
        let mut expected = hosts.clone();
        expanded.sort();
        expected.sort();

        prop_assert_eq!(expanded, expected);
    }

    #[test]
    fn unsplit_is_deterministic_under_shuffle(
        mut hosts in proptest::collection::vec("kn[0-9]{1,2}", 2..20),
    ) {
        let forward = unsplit_list(&hosts);
        hosts.reverse();
        let backward = unsplit_list(&hosts);

        prop_assert_eq!(forward, backward);
    }
}
