use std::collections::BTreeMap;

use maxdiff_harness::assembler::{assemble_choice_sets, extend_choice_sets, AssemblyParams};
use maxdiff_harness::design::{block_count, build_design, diagnose, extend_design, DesignMode, DesignParams};
use maxdiff_harness::vouchers::vouchers_from_amounts;
use maxdiff_harness::Feature;

fn ids(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("f{i}")).collect()
}

fn features(n: usize) -> Vec<Feature> {
    (1..=n)
        .map(|i| Feature::new(format!("f{i}"), format!("Feature {i}"), 40.0 * i as f64))
        .collect()
}

fn count_range(counts: &BTreeMap<String, usize>) -> usize {
    let lo = counts.values().min().copied().unwrap_or(0);
    let hi = counts.values().max().copied().unwrap_or(0);
    hi - lo
}

#[test]
fn same_seed_gives_identical_design() {
    let params = DesignParams {
        appearances: 6,
        seed: 42,
        ..DesignParams::default()
    };
    let a = build_design(&ids(12), &params, None);
    let b = build_design(&ids(12), &params, None);
    assert_eq!(a, b);
}

#[test]
fn near_bibd_balances_item_appearances() {
    for (v, k, r) in [(12, 3, 6), (9, 3, 4), (10, 4, 6), (7, 3, 3)] {
        let params = DesignParams {
            block_size: k,
            appearances: r,
            ..DesignParams::default()
        };
        let design = build_design(&ids(v), &params, None);
        assert_eq!(design.blocks.len(), block_count(v, k, r), "v={v} k={k} r={r}");
        assert!(count_range(&design.diagnostics.item_counts) <= 1, "v={v} k={k} r={r}");
        if (v * r) % k == 0 {
            assert!(design.diagnostics.item_counts.values().all(|&c| c == r));
        }
        assert!(design.diagnostics.objective <= design.greedy_objective);
    }
}

#[test]
fn near_bibd_spreads_pairs_widely() {
    let params = DesignParams {
        appearances: 6,
        ..DesignParams::default()
    };
    let design = build_design(&ids(7), &params, None);
    assert!(design.diagnostics.coverage > 0.8, "{}", design.diagnostics.coverage);
    assert_eq!(design.diagnostics.bibd.v, 7);
    assert_eq!(design.diagnostics.bibd.b, 14);
    assert_eq!(design.diagnostics.bibd.r, Some(6));
}

#[test]
fn legacy_mode_is_reproducible() {
    let params = DesignParams {
        mode: DesignMode::Legacy,
        appearances: 4,
        ..DesignParams::default()
    };
    let a = build_design(&ids(9), &params, None);
    let b = build_design(&ids(9), &params, None);
    assert_eq!(a.blocks, b.blocks);
    assert_eq!(a.blocks.len(), 12);
}

#[test]
fn extension_preserves_existing_blocks_and_adds_counts() {
    let params = DesignParams::default();
    let items = ids(8);
    let base = build_design(&items, &params, None);
    let extended = extend_design(&items, &base.blocks, 5, &params);

    assert_eq!(extended.blocks.len(), base.blocks.len() + 5);
    assert_eq!(&extended.blocks[..base.blocks.len()], base.blocks.as_slice());

    let added = diagnose(&items, &extended.blocks[base.blocks.len()..]);
    for id in &items {
        assert_eq!(
            extended.diagnostics.item_counts[id],
            base.diagnostics.item_counts[id] + added.item_counts[id],
            "{id}"
        );
    }
    let ext_total: usize = extended.diagnostics.item_counts.values().sum();
    assert_eq!(ext_total, (base.blocks.len() + 5) * params.block_size);
    assert!(count_range(&extended.diagnostics.item_counts) <= 1);
}

#[test]
fn build_design_on_existing_blocks_tops_up_to_target() {
    let items = ids(6);
    let small = DesignParams {
        appearances: 2,
        ..DesignParams::default()
    };
    let first = build_design(&items, &small, None);
    let full = DesignParams {
        appearances: 4,
        ..DesignParams::default()
    };
    let topped = build_design(&items, &full, Some(&first.blocks));
    assert_eq!(topped.blocks.len(), block_count(6, 3, 4));
    assert_eq!(&topped.blocks[..first.blocks.len()], first.blocks.as_slice());
}

#[test]
fn choice_set_extension_keeps_plan_prefix_and_fingerprint_changes() {
    let vouchers = vouchers_from_amounts(&[0.0, 25.0, 100.0, 400.0]);
    let params = AssemblyParams::default();
    let plan = assemble_choice_sets(&features(9), &vouchers, &params);
    let again = assemble_choice_sets(&features(9), &vouchers, &params);
    assert_eq!(plan.fingerprint(), again.fingerprint());

    let extended = extend_choice_sets(&plan, &features(9), &vouchers, 11, &params);
    assert_eq!(extended.sets.len(), plan.sets.len() + 11);
    assert_eq!(&extended.sets[..plan.sets.len()], plan.sets.as_slice());
    assert_eq!(extended.repeat_count(), plan.repeat_count() + 1);
    assert_ne!(extended.fingerprint(), plan.fingerprint());

    let before = plan.voucher_exposure();
    let after = extended.voucher_exposure();
    let added: usize = after.values().sum::<usize>() - before.values().sum::<usize>();
    assert_eq!(added, 11);
}

#[test]
fn extension_with_repeats_keeps_core_balance() {
    let vouchers = vouchers_from_amounts(&[0.0, 50.0, 200.0]);
    for n in [6, 8, 10] {
        for seed in 0..20 {
            let params = AssemblyParams {
                repeat_fraction: 0.5,
                seed,
                ..AssemblyParams::default()
            };
            let plan = assemble_choice_sets(&features(n), &vouchers, &params);
            assert!(plan.repeat_count() > 0);
            let extended = extend_choice_sets(&plan, &features(n), &vouchers, 12, &params);

            let core: Vec<_> = extended.blocks.iter().filter(|b| !b.is_repeat()).cloned().collect();
            let feature_ids = ids(n);
            let counts = diagnose(&feature_ids, &core).item_counts;
            assert!(count_range(&counts) <= 1, "n={n} seed={seed} {counts:?}");
            assert_eq!(counts, extended.diagnostics.item_counts);

            let mut set_ids: Vec<usize> = extended.sets.iter().map(|s| s.id).collect();
            set_ids.sort_unstable();
            set_ids.dedup();
            assert_eq!(set_ids.len(), extended.sets.len(), "n={n} seed={seed}");
            for set in extended.sets.iter().filter(|s| s.is_repeat()) {
                assert!(extended.set(set.repeat_of.unwrap()).is_some_and(|src| !src.is_repeat()));
            }
        }
    }
}
