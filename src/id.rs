//! Identifiers for sync runs and submitted jobs.
//!
//! Ids look like `bqt_job_k3v9...`: a kind tag followed by 20 characters
//! from a lowercase alphanumeric alphabet. Every character is legal in a
//! warehouse job id, so job ids can be chosen client-side and a retried
//! submission can be recognised.

const ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

const SUFFIX_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Run,
    Job,
}

impl IdKind {
    pub const fn tag(&self) -> &'static str {
        match self {
            IdKind::Run => "bqt_run_",
            IdKind::Job => "bqt_job_",
        }
    }

    /// The kind an id was generated for, if it has one of our tags and a
    /// well-formed suffix.
    pub fn of(id: &str) -> Option<Self> {
        [IdKind::Run, IdKind::Job].into_iter().find(|kind| {
            id.strip_prefix(kind.tag()).is_some_and(|suffix| {
                suffix.len() == SUFFIX_LEN && suffix.chars().all(|c| ALPHABET.contains(&c))
            })
        })
    }
}

pub fn generate_id(kind: IdKind) -> String {
    format!("{}{}", kind.tag(), nanoid::nanoid!(SUFFIX_LEN, &ALPHABET))
}

pub fn generate_run_id() -> String {
    generate_id(IdKind::Run)
}

pub fn generate_job_id() -> String {
    generate_id(IdKind::Job)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_carry_their_kind() {
        let run = generate_run_id();
        let job = generate_job_id();
        assert_eq!(run.len(), "bqt_run_".len() + SUFFIX_LEN);
        assert_eq!(IdKind::of(&run), Some(IdKind::Run));
        assert_eq!(IdKind::of(&job), Some(IdKind::Job));
        assert_ne!(generate_job_id(), job);
    }

    #[test]
    fn test_foreign_ids_have_no_kind() {
        assert_eq!(IdKind::of("job_abc123"), None);
        assert_eq!(IdKind::of("bqt_job_short"), None);
        assert_eq!(IdKind::of("bqt_job_ABCDEFGHIJKLMNOPQRST"), None);
    }
}
