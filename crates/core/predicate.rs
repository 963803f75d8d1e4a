//! Eligibility predicate and claim ordering.
//!
//! A record is eligible for `worker` at `now` iff
//!
//! ```text
//! failed_at IS NULL
//!   AND (queue = filter OR no filter)
//!   AND ((run_at <= now AND (locked_at IS NULL OR locked_at < lock_cutoff))
//!        OR locked_by = worker)
//! ```
//!
//! where `lock_cutoff = now - lock_timeout`. The last clause lets a worker
//! re-claim (renew) a job it already holds, regardless of `run_at`.
//!
//! Candidates are ranked by `priority DESC, run_at ASC, id ASC` on every store.

use chrono::{DateTime, TimeDelta, Utc};
use std::cmp::Ordering;

use crate::clock::to_millis;
use crate::job::JobRecord;
use crate::worker::Worker;

/// SQL `ORDER BY` body shared by every store.
pub const CLAIM_ORDER: &str = "priority DESC, run_at ASC, id ASC";

/// Placeholder syntax of a SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamStyle {
    /// `$1, $2, ...` (PostgreSQL).
    Dollar,
    /// `?` (MySQL, SQLite).
    Question,
}

/// A value bound into a rendered predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredicateParam<'a> {
    Text(&'a str),
    Millis(i64),
}

/// The eligibility condition for one `reserve` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityPredicate {
    now: DateTime<Utc>,
    lock_cutoff: DateTime<Utc>,
    worker_id: String,
    queue: Option<String>,
}

impl EligibilityPredicate {
    /// Build the predicate for `worker` from a single clock reading.
    pub fn new(worker: &Worker, now: DateTime<Utc>, lock_timeout: TimeDelta) -> Self {
        let lock_cutoff = now
            .checked_sub_signed(lock_timeout)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self {
            now,
            lock_cutoff,
            worker_id: worker.id().to_string(),
            queue: worker.queue_filter().map(str::to_string),
        }
    }

    /// The instant this claim is evaluated at; becomes `locked_at` on success.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Locks taken strictly before this instant are considered abandoned.
    pub fn lock_cutoff(&self) -> DateTime<Utc> {
        self.lock_cutoff
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// Evaluate the predicate against an in-memory record.
    pub fn matches(&self, record: &JobRecord) -> bool {
        if record.failed_at.is_some() {
            return false;
        }
        if let Some(queue) = &self.queue {
            if &record.queue != queue {
                return false;
            }
        }
        let due = record.run_at <= self.now;
        let unlocked_or_stale = match record.locked_at {
            None => true,
            Some(locked_at) => locked_at < self.lock_cutoff,
        };
        (due && unlocked_or_stale) || record.locked_by.as_deref() == Some(self.worker_id.as_str())
    }

    /// Render the predicate as a SQL boolean expression.
    ///
    /// Placeholders are numbered from `first_param` for [`ParamStyle::Dollar`].
    /// Bind [`EligibilityPredicate::params`] in order.
    pub fn to_sql(&self, style: ParamStyle, first_param: usize) -> String {
        let mut next = first_param;
        let mut param = || {
            let placeholder = match style {
                ParamStyle::Dollar => format!("${}", next),
                ParamStyle::Question => "?".to_string(),
            };
            next += 1;
            placeholder
        };

        let mut sql = String::from("failed_at IS NULL");
        if self.queue.is_some() {
            sql.push_str(&format!(" AND queue = {}", param()));
        }
        let now = param();
        let cutoff = param();
        let worker = param();
        sql.push_str(&format!(
            " AND ((run_at <= {} AND (locked_at IS NULL OR locked_at < {})) OR locked_by = {})",
            now, cutoff, worker
        ));
        sql
    }

    /// Values for the placeholders produced by [`EligibilityPredicate::to_sql`].
    pub fn params(&self) -> Vec<PredicateParam<'_>> {
        let mut params = Vec::with_capacity(4);
        if let Some(queue) = &self.queue {
            params.push(PredicateParam::Text(queue));
        }
        params.push(PredicateParam::Millis(to_millis(self.now)));
        params.push(PredicateParam::Millis(to_millis(self.lock_cutoff)));
        params.push(PredicateParam::Text(&self.worker_id));
        params
    }
}

/// Claim ranking: higher priority, then earlier `run_at`, then lower id.
pub fn claim_order(a: &JobRecord, b: &JobRecord) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.run_at.cmp(&b.run_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::from_millis;
    use crate::job::{JobId, JobInsert};

    const NOW: i64 = 1_700_000_000_000;

    fn record(id: i64, priority: i32, run_at: i64) -> JobRecord {
        JobInsert {
            handler: "h".to_string(),
            payload: "{}".to_string(),
            priority,
            queue: "default".to_string(),
            run_at: from_millis(run_at),
            created_at: from_millis(run_at),
        }
        .into_record(JobId(id))
    }

    fn predicate(worker: &str) -> EligibilityPredicate {
        EligibilityPredicate::new(
            &Worker::new(worker).unwrap(),
            from_millis(NOW),
            TimeDelta::minutes(60),
        )
    }

    #[test]
    fn test_cutoff_is_now_minus_timeout() {
        let p = predicate("w1");
        assert_eq!(p.now(), from_millis(NOW));
        assert_eq!(p.lock_cutoff(), from_millis(NOW - 3_600_000));
    }

    #[test]
    fn test_due_unlocked_matches() {
        assert!(predicate("w1").matches(&record(1, 0, NOW)));
        assert!(predicate("w1").matches(&record(1, 0, NOW - 1)));
    }

    #[test]
    fn test_future_run_at_excluded() {
        assert!(!predicate("w1").matches(&record(1, 0, NOW + 1)));
    }

    #[test]
    fn test_failed_excluded_even_for_owner() {
        let mut r = record(1, 0, NOW);
        r.lock("w1", from_millis(NOW - 10));
        r.failed_at = Some(from_millis(NOW - 5));
        assert!(!predicate("w1").matches(&r));
    }

    #[test]
    fn test_fresh_lock_excluded_for_others() {
        let mut r = record(1, 0, NOW - 1_000);
        r.lock("w1", from_millis(NOW - 1_000));
        assert!(!predicate("w2").matches(&r));
    }

    #[test]
    fn test_stale_lock_boundary_is_strict() {
        let mut r = record(1, 0, NOW - 4_000_000);
        r.lock("w1", from_millis(NOW - 3_600_000));
        assert!(!predicate("w2").matches(&r));

        r.lock("w1", from_millis(NOW - 3_600_001));
        assert!(predicate("w2").matches(&r));
    }

    #[test]
    fn test_owner_reclaims_regardless_of_run_at() {
        let mut r = record(1, 0, NOW + 60_000);
        r.lock("w1", from_millis(NOW - 10));
        assert!(predicate("w1").matches(&r));
    }

    #[test]
    fn test_queue_filter() {
        let worker = Worker::new("w1").unwrap().queue("mail");
        let p = EligibilityPredicate::new(&worker, from_millis(NOW), TimeDelta::minutes(60));
        let mut r = record(1, 0, NOW);
        assert!(!p.matches(&r));
        r.queue = "mail".to_string();
        assert!(p.matches(&r));
    }

    #[test]
    fn test_claim_order() {
        let mut records = vec![
            record(4, 0, NOW - 10),
            record(3, 5, NOW),
            record(2, 0, NOW - 10),
            record(1, 0, NOW),
        ];
        records.sort_by(claim_order);
        let ids: Vec<i64> = records.iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec![3, 2, 4, 1]);
    }

    #[test]
    fn test_sql_dollar_without_queue() {
        let p = predicate("w1");
        assert_eq!(
            p.to_sql(ParamStyle::Dollar, 1),
            "failed_at IS NULL AND ((run_at <= $1 AND (locked_at IS NULL OR locked_at < $2)) OR locked_by = $3)"
        );
        assert_eq!(
            p.params(),
            vec![
                PredicateParam::Millis(NOW),
                PredicateParam::Millis(NOW - 3_600_000),
                PredicateParam::Text("w1"),
            ]
        );
    }

    #[test]
    fn test_sql_question_with_queue() {
        let worker = Worker::new("w1").unwrap().queue("mail");
        let p = EligibilityPredicate::new(&worker, from_millis(NOW), TimeDelta::minutes(60));
        assert_eq!(
            p.to_sql(ParamStyle::Question, 1),
            "failed_at IS NULL AND queue = ? AND ((run_at <= ? AND (locked_at IS NULL OR locked_at < ?)) OR locked_by = ?)"
        );
        assert_eq!(p.params().len(), 4);
        assert_eq!(p.params()[0], PredicateParam::Text("mail"));
    }

    #[test]
    fn test_sql_dollar_offset() {
        let worker = Worker::new("w1").unwrap().queue("mail");
        let p = EligibilityPredicate::new(&worker, from_millis(NOW), TimeDelta::minutes(60));
        let sql = p.to_sql(ParamStyle::Dollar, 3);
        assert!(sql.contains("queue = $3"));
        assert!(sql.contains("locked_by = $6"));
    }
}
