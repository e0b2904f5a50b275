//! Property-based tests for the encounter state machine
//!
//! Tests invariants:
//! - Turn index stays in range across any operation sequence
//! - Round is monotonic except for reset
//! - Hit points stay bounded and the defeated flag tracks zero HP
//! - Initiative order is stable

use proptest::prelude::*;

use crate::core::encounter::{
    Combatant, CombatantKind, Condition, EncounterMachine, HealthUpdate, HitPoints,
    StaticConditionCatalog,
};

// ============================================================================
// Strategies for generating test inputs
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    NextTurn,
    Damage(usize, u32),
    Heal(usize, u32),
    SetHp(usize, u32),
    Add(i32, u32),
    Remove(usize),
    Condition(usize, Option<u32>),
    Reset,
}

fn arb_combatants() -> impl Strategy<Value = Vec<(i32, u32)>> {
    prop::collection::vec((0i32..25, 1u32..60), 0..8)
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::NextTurn),
        3 => (0usize..10, 0u32..40).prop_map(|(i, a)| Op::Damage(i, a)),
        2 => (0usize..10, 0u32..40).prop_map(|(i, a)| Op::Heal(i, a)),
        1 => (0usize..10, 0u32..80).prop_map(|(i, c)| Op::SetHp(i, c)),
        2 => (0i32..25, 1u32..60).prop_map(|(init, hp)| Op::Add(init, hp)),
        2 => (0usize..10).prop_map(Op::Remove),
        2 => (0usize..10, prop::option::of(1u32..4)).prop_map(|(i, d)| Op::Condition(i, d)),
        1 => Just(Op::Reset),
    ]
}

fn started(specs: &[(i32, u32)]) -> EncounterMachine {
    let combatants = specs
        .iter()
        .enumerate()
        .map(|(i, (init, hp))| {
            Combatant::new(format!("c{}", i), format!("C{}", i), CombatantKind::NonPlayerCharacter, *init, HitPoints::full(*hp))
        })
        .collect();
    let mut machine = EncounterMachine::new("enc", "sess", "Prop", Vec::new());
    machine.start(combatants).expect("start from planned");
    machine.drain_events();
    machine
}

/// Id of the combatant at `index` modulo the roster, if any
fn pick(machine: &EncounterMachine, index: usize) -> Option<String> {
    let combatants = machine.combatants();
    if combatants.is_empty() {
        None
    } else {
        Some(combatants[index % combatants.len()].id.clone())
    }
}

fn apply(machine: &mut EncounterMachine, op: &Op, fresh: &mut usize, catalog: &StaticConditionCatalog) {
    let result = match op {
        Op::NextTurn => machine.next_turn().map(|_| ()),
        Op::Damage(i, amount) => match pick(machine, *i) {
            Some(id) => machine.apply_damage(&id, *amount).map(|_| ()),
            None => Ok(()),
        },
        Op::Heal(i, amount) => match pick(machine, *i) {
            Some(id) => machine.apply_healing(&id, *amount).map(|_| ()),
            None => Ok(()),
        },
        Op::SetHp(i, current) => match pick(machine, *i) {
            Some(id) => machine
                .set_hit_points(&id, HealthUpdate { current: *current, max: None, temporary: None })
                .map(|_| ()),
            None => Ok(()),
        },
        Op::Add(init, hp) => {
            *fresh += 1;
            let id = format!("added{}", fresh);
            machine
                .add_combatant(Combatant::new(id.clone(), id, CombatantKind::Monster, *init, HitPoints::full(*hp)))
                .map(|_| ())
        }
        Op::Remove(i) => match pick(machine, *i) {
            Some(id) => machine.remove_combatant(&id).map(|_| ()),
            None => Ok(()),
        },
        Op::Condition(i, duration) => match pick(machine, *i) {
            Some(id) => machine
                .add_condition(&id, Condition::new("Prone", *duration), catalog)
                .map(|_| ()),
            None => Ok(()),
        },
        Op::Reset => machine.reset().map(|_| ()),
    };
    assert!(result.is_ok(), "{:?} failed: {:?}", op, result);
    machine.drain_events();
}

fn is_initiative_ordered(machine: &EncounterMachine) -> bool {
    machine.combatants().windows(2).all(|w| {
        w[0].initiative > w[1].initiative
            || (w[0].initiative == w[1].initiative && w[0].added_seq < w[1].added_seq)
    })
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Property: the turn pointer always lands on a combatant
    #[test]
    fn prop_turn_index_in_range(
        specs in arb_combatants(),
        ops in prop::collection::vec(arb_op(), 0..60)
    ) {
        let catalog = StaticConditionCatalog::new();
        let mut machine = started(&specs);
        let mut fresh = 0;

        for op in &ops {
            apply(&mut machine, op, &mut fresh, &catalog);
            let len = machine.combatants().len();
            if len == 0 {
                prop_assert_eq!(machine.turn_index(), 0);
            } else {
                prop_assert!(
                    machine.turn_index() < len,
                    "turn {} out of range for {} combatants after {:?}",
                    machine.turn_index(),
                    len,
                    op
                );
            }
        }
    }

    /// Property: only a reset lowers the round counter, and never below 1
    #[test]
    fn prop_round_is_monotonic(
        specs in arb_combatants(),
        ops in prop::collection::vec(arb_op(), 0..60)
    ) {
        let catalog = StaticConditionCatalog::new();
        let mut machine = started(&specs);
        let mut fresh = 0;

        for op in &ops {
            let before = machine.round();
            apply(&mut machine, op, &mut fresh, &catalog);
            let after = machine.round();

            prop_assert!(after >= 1);
            match op {
                Op::Reset => prop_assert_eq!(after, 1),
                Op::NextTurn => prop_assert!(after == before || after == before + 1),
                _ => prop_assert_eq!(after, before),
            }
        }
    }

    /// Property: current HP stays within [0, max] and defeated tracks zero
    #[test]
    fn prop_hit_points_bounded(
        specs in arb_combatants(),
        ops in prop::collection::vec(arb_op(), 0..60)
    ) {
        let catalog = StaticConditionCatalog::new();
        let mut machine = started(&specs);
        let mut fresh = 0;

        for op in &ops {
            apply(&mut machine, op, &mut fresh, &catalog);
            for c in machine.combatants() {
                prop_assert!(c.hit_points.current <= c.hit_points.max);
                prop_assert!(c.hit_points.max >= 1);
                prop_assert_eq!(c.defeated, c.hit_points.current == 0, "{:?}", c);
            }
        }
    }

    /// Property: the roster stays in initiative order and adds keep the current turn
    #[test]
    fn prop_initiative_order_stable(
        specs in arb_combatants(),
        ops in prop::collection::vec(arb_op(), 0..60)
    ) {
        let catalog = StaticConditionCatalog::new();
        let mut machine = started(&specs);
        let mut fresh = 0;
        prop_assert!(is_initiative_ordered(&machine));

        for op in &ops {
            let current = machine.current_combatant().map(|c| c.id.clone());
            apply(&mut machine, op, &mut fresh, &catalog);
            prop_assert!(is_initiative_ordered(&machine), "order broken by {:?}", op);

            if let (Op::Add(..), Some(id)) = (op, current) {
                prop_assert_eq!(machine.current_combatant().map(|c| c.id.clone()), Some(id));
            }
        }
    }

    /// Property: without temporary HP, damage up to current HP followed by
    /// equal healing restores it
    #[test]
    fn prop_damage_then_heal_restores(max in 1u32..200, fraction in 0.0f64..=1.0) {
        let mut machine = started(&[(10, max)]);
        let amount = (f64::from(max) * fraction) as u32;

        machine.apply_damage("c0", amount).unwrap();
        machine.apply_healing("c0", amount).unwrap();

        let c = machine.combatant("c0").unwrap();
        prop_assert_eq!(c.hit_points.current, max);
        prop_assert!(!c.defeated);
    }

    /// Property: temporary HP absorbs damage before current HP
    #[test]
    fn prop_temporary_hp_absorbs_first(max in 1u32..100, temporary in 0u32..50, amount in 0u32..200) {
        let mut machine = started(&[(10, max)]);
        machine
            .set_hit_points("c0", HealthUpdate { current: max, max: None, temporary: Some(temporary) })
            .unwrap();

        machine.apply_damage("c0", amount).unwrap();

        let hp = machine.combatant("c0").unwrap().hit_points;
        prop_assert_eq!(hp.temporary, temporary.saturating_sub(amount));
        prop_assert_eq!(hp.current, max.saturating_sub(amount.saturating_sub(temporary)));
    }

    /// Property: with temporary HP the round trip is not symmetric. The
    /// absorbed part is gone for good while healing still lands on current
    /// HP, so current ends up raised by the absorbed amount (capped at max).
    #[test]
    fn prop_damage_then_heal_with_temporary_hp(
        max in 1u32..100,
        wounds in 0u32..100,
        temporary in 1u32..50,
        fraction in 0.0f64..=1.0,
    ) {
        let current = max - wounds.min(max - 1);
        let mut machine = started(&[(10, max)]);
        machine
            .set_hit_points("c0", HealthUpdate { current, max: None, temporary: Some(temporary) })
            .unwrap();
        // never more than temporary + current, so the combatant stays up
        let amount = (f64::from(temporary + current - 1) * fraction) as u32;

        machine.apply_damage("c0", amount).unwrap();
        machine.apply_healing("c0", amount).unwrap();

        let absorbed = amount.min(temporary);
        let hp = machine.combatant("c0").unwrap().hit_points;
        prop_assert_eq!(hp.temporary, temporary - absorbed);
        prop_assert_eq!(hp.current, (current + absorbed).min(max));
        prop_assert!(!machine.combatant("c0").unwrap().defeated);
    }

    /// Property: a `Latest` condition applied repeatedly leaves one entry
    #[test]
    fn prop_latest_condition_replaces(durations in prop::collection::vec(prop::option::of(1u32..10), 1..8)) {
        let catalog = StaticConditionCatalog::new();
        let mut machine = started(&[(10, 10)]);

        for duration in &durations {
            machine
                .add_condition("c0", Condition::new("Frightened", *duration), &catalog)
                .unwrap();
        }

        let conditions = machine.combatant("c0").unwrap().conditions.conditions().to_vec();
        prop_assert_eq!(conditions.len(), 1);
        prop_assert_eq!(conditions[0].remaining, *durations.last().unwrap());
    }
}
