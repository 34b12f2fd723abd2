#[cfg(test)]
mod stats_tests {
    use crate::density::{estimate, Bandwidth, DensityGrid, DensityParams, GridSpec};
    use crate::process::NicheError;
    use crate::stats::*;
    use crate::tests::{cluster, lattice};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn params() -> DensityParams {
        DensityParams {
            bandwidth: Bandwidth::Fixed(0.3),
            ..DensityParams::default()
        }
    }

    fn spec() -> GridSpec {
        GridSpec::from_scores(&lattice(0.0, 10.0, 0.0, 10.0, 0.5), 51).unwrap()
    }

    fn grid(name: &str, background: &[[f64; 2]], occurrences: &[[f64; 2]]) -> DensityGrid {
        estimate(name, &spec(), background, occurrences, &params()).unwrap()
    }

    fn metric_params(rep: usize, seed: u64) -> MetricParams {
        MetricParams {
            rep,
            alternative: Alternative::Greater,
            seed,
            density: params(),
        }
    }

    #[test]
    fn test_identical_niches() {
        let bg = lattice(0.0, 10.0, 0.0, 10.0, 0.5);
        let a = grid("A", &bg, &cluster(3.0, 3.0, 0.5));
        let b = grid("B", &bg, &cluster(3.0, 3.0, 0.5));

        let d = schoener_d(&a, &b).unwrap();
        assert!((d - 1.0).abs() < 1e-12, "D = {}", d);

        let idx = dynamic_index(&a, &b).unwrap();
        assert!(idx.expansion.abs() < 1e-12);
        assert!((idx.stability - 1.0).abs() < 1e-12);
        assert!(idx.unfilling.abs() < 1e-12);
    }

    #[test]
    fn test_disjoint_niches() {
        let bg = lattice(0.0, 10.0, 0.0, 10.0, 0.5);
        let a = grid("A", &bg, &cluster(2.0, 2.0, 0.2));
        let c = grid("C", &bg, &cluster(8.0, 8.0, 0.2));

        assert_eq!(schoener_d(&a, &c).unwrap(), 0.0);

        let idx = dynamic_index(&a, &c).unwrap();
        assert_eq!(idx.stability, 0.0);
        // Shared background: nothing of A lies outside C's support.
        assert_eq!(idx.expansion, 0.0);
        // All of C is available to A and unoccupied by A.
        assert!((idx.unfilling - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_expansion_into_unavailable_environment() {
        let full = lattice(0.0, 10.0, 0.0, 10.0, 0.5);
        let partial = lattice(0.0, 5.0, 0.0, 5.0, 0.5);
        let a = grid("A", &full, &cluster(8.0, 8.0, 0.2));
        let b = grid("B", &partial, &cluster(2.0, 2.0, 0.2));

        let ab = dynamic_index(&a, &b).unwrap();
        assert!((ab.expansion - 1.0).abs() < 1e-12, "expansion = {}", ab.expansion);
        assert_eq!(ab.stability, 0.0);
        assert!(ab.expansion + ab.stability <= 1.0 + 1e-12);

        // B sits inside A's background, so nothing of B is novel to A.
        let ba = dynamic_index(&b, &a).unwrap();
        assert_eq!(ba.expansion, 0.0);
        assert!((ba.unfilling - 0.0).abs() < 1e-12);
    }

    #[test]
    fn test_partial_overlap_bounds_and_symmetry() {
        let bg = lattice(0.0, 10.0, 0.0, 10.0, 0.5);
        let a = grid("A", &bg, &cluster(4.0, 4.0, 1.0));
        let b = grid("B", &bg, &cluster(4.6, 4.4, 1.0));

        let ab = schoener_d(&a, &b).unwrap();
        let ba = schoener_d(&b, &a).unwrap();
        assert!(ab > 0.0 && ab < 1.0, "D = {}", ab);
        assert!((ab - ba).abs() < 1e-12);

        let idx = dynamic_index(&a, &b).unwrap();
        assert!(idx.expansion + idx.stability <= 1.0 + 1e-12);
        assert!(idx.stability > 0.0);
    }

    #[test]
    fn test_mismatched_grids_rejected() {
        let bg = lattice(0.0, 10.0, 0.0, 10.0, 0.5);
        let a = grid("A", &bg, &cluster(4.0, 4.0, 1.0));
        let other_spec = GridSpec::from_scores(&bg, 20).unwrap();
        let b = estimate("B", &other_spec, &bg, &cluster(4.0, 4.0, 1.0), &params()).unwrap();

        match schoener_d(&a, &b) {
            Err(NicheError::DimensionMismatch(_)) => {}
            other => panic!("expected DimensionMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_similarity_test_detects_shared_niche() {
        let bg = lattice(0.0, 10.0, 0.0, 10.0, 0.5);
        let a = GroupNiche::build("A", &spec(), bg.clone(), cluster(3.0, 3.0, 0.3), &params()).unwrap();
        let b = grid("B", &bg, &cluster(3.0, 3.0, 0.3));
        let c = grid("C", &bg, &cluster(8.0, 8.0, 0.3));

        let p = metric_params(19, 7);
        let mut rng = StdRng::seed_from_u64(pair_seed(7, 0, 1));
        let sim_ab = similarity_test(&a, &b, &p, &mut rng).unwrap();
        assert!((sim_ab.observed - 1.0).abs() < 1e-12);
        assert!((sim_ab.p_value - 0.05).abs() < 1e-12, "p = {}", sim_ab.p_value);
        assert!(sim_ab.null_mean < sim_ab.observed);

        let mut rng = StdRng::seed_from_u64(pair_seed(7, 0, 2));
        let sim_ac = similarity_test(&a, &c, &p, &mut rng).unwrap();
        assert_eq!(sim_ac.observed, 0.0);
        assert_eq!(sim_ac.p_value, 1.0);
    }

    #[test]
    fn test_similarity_test_reproducible() {
        let bg = lattice(0.0, 10.0, 0.0, 10.0, 0.5);
        let a = GroupNiche::build("A", &spec(), bg.clone(), cluster(4.0, 4.0, 2.0), &params()).unwrap();
        let b = grid("B", &bg, &cluster(5.0, 5.0, 2.0));
        let p = metric_params(15, 99);

        let first = similarity_test(&a, &b, &p, &mut StdRng::seed_from_u64(pair_seed(99, 0, 1))).unwrap();
        let second = similarity_test(&a, &b, &p, &mut StdRng::seed_from_u64(pair_seed(99, 0, 1))).unwrap();
        assert_eq!(first, second);
        assert!(first.p_value > 0.0 && first.p_value <= 1.0);
    }

    #[test]
    fn test_similarity_lower_alternative() {
        let bg = lattice(0.0, 10.0, 0.0, 10.0, 0.5);
        let a = GroupNiche::build("A", &spec(), bg.clone(), cluster(2.0, 2.0, 0.3), &params()).unwrap();
        let c = grid("C", &bg, &cluster(8.0, 8.0, 0.3));
        let p = MetricParams {
            alternative: Alternative::Lower,
            ..metric_params(9, 3)
        };
        let sim = similarity_test(&a, &c, &p, &mut StdRng::seed_from_u64(1)).unwrap();
        // Observed D of zero is never beaten from below, only tied.
        assert!(sim.p_value > 0.0 && sim.p_value <= 1.0);
    }

    #[test]
    fn test_zero_rep_rejected() {
        let bg = lattice(0.0, 10.0, 0.0, 10.0, 0.5);
        let a = GroupNiche::build("A", &spec(), bg.clone(), cluster(2.0, 2.0, 0.3), &params()).unwrap();
        let b = grid("B", &bg, &cluster(2.0, 2.0, 0.3));
        let result = similarity_test(&a, &b, &metric_params(0, 1), &mut StdRng::seed_from_u64(1));
        assert!(matches!(result, Err(NicheError::Config(_))));
    }

    #[test]
    fn test_pair_seed_is_directional() {
        assert_ne!(pair_seed(42, 0, 1), pair_seed(42, 1, 0));
        assert_ne!(pair_seed(42, 0, 1), pair_seed(43, 0, 1));
        assert_eq!(pair_seed(42, 2, 5), pair_seed(42, 2, 5));
    }

    #[test]
    fn test_compare_all_order_and_failures() {
        let bg = lattice(0.0, 10.0, 0.0, 10.0, 0.5);
        let names = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let niches = vec![
            GroupNiche::build("A", &spec(), bg.clone(), cluster(3.0, 3.0, 0.5), &params()).map_err(|e| e.to_string()),
            Err("no occupied cells".to_string()),
            GroupNiche::build("C", &spec(), bg.clone(), cluster(6.0, 6.0, 0.5), &params()).map_err(|e| e.to_string()),
        ];
        let outcomes = compare_all(&names, &niches, &metric_params(5, 11));

        let pairs: Vec<(usize, usize)> = outcomes.iter().map(|o| (o.i, o.j)).collect();
        assert_eq!(pairs, vec![(0, 1), (0, 2), (1, 2)]);
        assert!(outcomes[0].result.is_err());
        assert!(outcomes[2].result.is_err());
        assert!(outcomes[0].result.as_ref().unwrap_err().contains("'B'"));

        let ac = outcomes[1].result.as_ref().unwrap();
        assert!(ac.overlap >= 0.0 && ac.overlap <= 1.0);

        // Same inputs and seed reproduce the same metrics.
        let again = compare_all(&names, &niches, &metric_params(5, 11));
        assert_eq!(again[1].result.as_ref().unwrap(), ac);
    }

    #[test]
    fn test_alternative_parsing() {
        assert_eq!("greater".parse::<Alternative>().unwrap(), Alternative::Greater);
        assert_eq!("LOWER".parse::<Alternative>().unwrap(), Alternative::Lower);
        assert!("both".parse::<Alternative>().is_err());
    }
}
