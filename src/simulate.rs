//! Monte-Carlo preview of which competencies a randomized exam covers.
//!
//! Question sources mark random slots with `:proficiency: <tag>` (any question carrying that
//! competency) or `:fromid: a, b, c` (one of the listed questions). Each trial draws one question
//! per slot and tallies the competencies of everything drawn.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use regex::Regex;
use rusqlite::Connection;
use serde::Serialize;
use tracing::debug;

use crate::catalog::{self, Competency};
use crate::context::RequestContext;
use crate::error::AssignResult;

fn proficiency_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":proficiency:\s+(\w+)").ok()).as_ref()
}

fn fromid_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":fromid:[ \t]+([^\n]+)").ok()).as_ref()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedPool {
    /// Name of the selector question carrying the annotation.
    pub selector: String,
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExamPlan {
    pub proficiency_tags: Vec<String>,
    pub fixed_pools: Vec<FixedPool>,
}

impl ExamPlan {
    pub fn is_empty(&self) -> bool {
        self.proficiency_tags.is_empty() && self.fixed_pools.is_empty()
    }

    /// Adds the slots declared in one question's source.
    pub fn scan(&mut self, question_name: &str, source: &str) {
        if let Some(tag) = proficiency_re().and_then(|re| re.captures(source)).and_then(|c| c.get(1)) {
            let tag = tag.as_str().to_string();
            if !self.proficiency_tags.contains(&tag) {
                self.proficiency_tags.push(tag);
            }
        }
        if let Some(list) = fromid_re().and_then(|re| re.captures(source)).and_then(|c| c.get(1)) {
            let candidates: Vec<String> = list
                .as_str()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !candidates.is_empty() {
                self.fixed_pools.push(FixedPool {
                    selector: question_name.to_string(),
                    candidates,
                });
            }
        }
    }
}

/// Everything a simulation reads, resolved up front so the trial loop touches no storage.
#[derive(Debug, Clone, Default)]
pub struct SimulationInput {
    /// One pool of question ids per slot.
    pub slots: Vec<Vec<String>>,
    pub competencies: HashMap<String, Vec<Competency>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub trials: usize,
    pub slots: usize,
    pub primary_frequency: BTreeMap<String, u64>,
    pub secondary_frequency: BTreeMap<String, u64>,
}

pub fn load_input(
    conn: &Connection,
    ctx: &RequestContext,
    assignment_id: &str,
) -> AssignResult<SimulationInput> {
    crate::assignment::fetch_in_course(conn, ctx, assignment_id)?;
    let mut stmt = conn.prepare(
        "SELECT q.name, q.source FROM assignment_questions aq
         JOIN questions q ON q.id = aq.question_id
         WHERE aq.assignment_id = ?
         ORDER BY aq.reading_assignment, aq.sorting_priority",
    )?;
    let sources = stmt
        .query_map([assignment_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut plan = ExamPlan::default();
    for (name, source) in &sources {
        plan.scan(name, source.as_deref().unwrap_or(""));
    }
    debug!(
        assignment_id,
        proficiencies = plan.proficiency_tags.len(),
        fixed = plan.fixed_pools.len(),
        "exam plan scanned"
    );
    if plan.is_empty() {
        return Ok(SimulationInput::default());
    }

    let mut input = SimulationInput::default();
    for tag in &plan.proficiency_tags {
        let pool = catalog::questions_with_competency(conn, tag)?;
        if pool.is_empty() {
            debug!(tag = %tag, "no questions carry competency, slot dropped");
            continue;
        }
        input.slots.push(pool);
    }
    for fixed in &plan.fixed_pools {
        let mut pool = Vec::with_capacity(fixed.candidates.len());
        for name in &fixed.candidates {
            match catalog::find_question_id_by_name(conn, name)? {
                Some(id) => pool.push(id),
                None => debug!(selector = %fixed.selector, candidate = %name, "unknown candidate skipped"),
            }
        }
        if !pool.is_empty() {
            input.slots.push(pool);
        }
    }

    for slot in &input.slots {
        for id in slot {
            if !input.competencies.contains_key(id) {
                let comps = catalog::fetch_competencies(conn, id)?;
                input.competencies.insert(id.clone(), comps);
            }
        }
    }
    Ok(input)
}

/// Runs `trials` draws. Each trial gets its own generator seeded from `rng`, so the result
/// depends only on the input and the seed.
pub fn simulate<R: Rng + ?Sized>(input: &SimulationInput, trials: usize, rng: &mut R) -> SimulationResult {
    let mut result = SimulationResult {
        trials,
        slots: input.slots.len(),
        ..Default::default()
    };
    if input.slots.is_empty() {
        return result;
    }

    for _ in 0..trials {
        let mut trial_rng = StdRng::seed_from_u64(rng.gen());
        for pool in &input.slots {
            let Some(qid) = pool.choose(&mut trial_rng) else {
                continue;
            };
            for comp in input.competencies.get(qid).map(Vec::as_slice).unwrap_or_default() {
                let table = if comp.is_primary {
                    &mut result.primary_frequency
                } else {
                    &mut result.secondary_frequency
                };
                *table.entry(comp.tag.clone()).or_insert(0) += 1;
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment;
    use crate::catalog::{fixtures, CatalogPayload};
    use crate::composer::{AssignmentLocks, Composer, QuestionRef, QuestionSettings};
    use crate::db::open_memory;

    fn comp(tag: &str, primary: bool) -> Competency {
        Competency {
            tag: tag.into(),
            is_primary: primary,
        }
    }

    fn input() -> SimulationInput {
        SimulationInput {
            slots: vec![
                vec!["a".into(), "b".into()],
                vec!["c".into()],
            ],
            competencies: HashMap::from([
                ("a".to_string(), vec![comp("loops", true), comp("lists", false)]),
                ("b".to_string(), vec![comp("strings", true)]),
                ("c".to_string(), vec![comp("functions", true), comp("loops", false)]),
            ]),
        }
    }

    #[test]
    fn same_seed_gives_identical_tables() {
        let a = simulate(&input(), 100, &mut StdRng::seed_from_u64(7));
        let b = simulate(&input(), 100, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
        assert_eq!(a.primary_frequency.get("functions"), Some(&100));
        assert_eq!(
            a.primary_frequency.get("loops").unwrap_or(&0) + a.primary_frequency.get("strings").unwrap_or(&0),
            100
        );
    }

    #[test]
    fn empty_plan_gives_empty_tables() {
        let r = simulate(&SimulationInput::default(), 100, &mut StdRng::seed_from_u64(1));
        assert!(r.primary_frequency.is_empty());
        assert!(r.secondary_frequency.is_empty());
        assert_eq!(r.trials, 100);
    }

    #[test]
    fn scan_reads_both_annotations() {
        let mut plan = ExamPlan::default();
        plan.scan("sel1", ".. selectquestion:: sel1\n   :fromid: q1, q2 ,q3\n   :points: 2\n");
        plan.scan("sel2", ".. selectquestion:: sel2\n   :proficiency: loops\n");
        plan.scan("sel3", ":proficiency: loops\n");
        plan.scan("plain", "no annotations here");
        plan.scan("broken", ":fromid:\n");
        assert_eq!(plan.proficiency_tags, vec!["loops".to_string()]);
        assert_eq!(
            plan.fixed_pools,
            vec![FixedPool {
                selector: "sel1".into(),
                candidates: vec!["q1".into(), "q2".into(), "q3".into()],
            }]
        );
    }

    #[test]
    fn load_input_resolves_pools_and_skips_unknowns() {
        let conn = open_memory();
        fixtures::seed(&conn);
        let payload: CatalogPayload = serde_json::from_value(serde_json::json!({
            "questions": [
                { "id": "q-sel", "name": "sel", "baseCourse": "pybook", "questionType": "selectquestion",
                  "source": ":fromid: Q1, ghost\n" },
                { "id": "q-prof", "name": "prof", "baseCourse": "pybook", "questionType": "selectquestion",
                  "source": ":proficiency: recursion\n" },
                { "id": "q-none", "name": "none", "baseCourse": "pybook", "questionType": "selectquestion",
                  "source": ":proficiency: nobody\n" }
            ],
            "competencies": [
                { "questionId": "q-mc", "competency": "loops", "isPrimary": true },
                { "questionId": "q-code", "competency": "recursion", "isPrimary": true },
                { "questionId": "q-code", "competency": "loops", "isPrimary": false }
            ]
        }))
        .unwrap();
        catalog::load(&conn, &payload).unwrap();

        let ctx = RequestContext::for_course("c-book");
        let a = assignment::create(&conn, &ctx, "Exam", None).unwrap();
        let locks = AssignmentLocks::default();
        let c = Composer::new(&conn, &locks, &ctx);
        for id in ["q-sel", "q-prof", "q-none"] {
            c.add_or_update_question(&a.id, &QuestionRef::Id(id.into()), &QuestionSettings::default())
                .unwrap();
        }

        let input = load_input(&conn, &ctx, &a.id).unwrap();
        assert_eq!(input.slots, vec![vec!["q-code".to_string()], vec!["q-mc".to_string()]]);

        let r = simulate(&input, 10, &mut StdRng::seed_from_u64(3));
        assert_eq!(r.primary_frequency.get("recursion"), Some(&10));
        assert_eq!(r.primary_frequency.get("loops"), Some(&10));
        assert_eq!(r.secondary_frequency.get("loops"), Some(&10));
    }
}
