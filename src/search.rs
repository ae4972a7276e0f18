use std::time::{Duration, Instant};

use log::debug;

use crate::error::{Error, Result};

/// Number of candidates tested in parallel per round, once the range is wide enough.
pub const ROUND_WIDTH: usize = 11;

/// Candidate MTUs for one round, ascending, first is `min_mtu`, last is `max_mtu`.
///
/// Narrow ranges (at most 10 apart) are enumerated densely. Wider ranges get
/// `min_mtu`, nine evenly spaced points and `max_mtu`.
pub fn make_mtus_to_test(min_mtu: u32, max_mtu: u32) -> Result<Vec<u32>> {
    if min_mtu > max_mtu {
        return Err(Error::InvalidRange { min: min_mtu, max: max_mtu });
    }
    let span = max_mtu - min_mtu;
    if span as usize <= ROUND_WIDTH - 1 {
        return Ok((min_mtu..=max_mtu).collect());
    }

    let step = span as f64 / (ROUND_WIDTH - 1) as f64;
    let mut result = Vec::with_capacity(ROUND_WIDTH);
    result.push(min_mtu);
    for i in 1..(ROUND_WIDTH - 1) {
        result.push(min_mtu + (step * i as f64).round() as u32);
    }
    result.push(max_mtu);
    Ok(result)
}

/// What one round tells us about the path.
#[derive(Debug, PartialEq, Eq)]
pub enum RoundVerdict {
    Found(u32),
    Narrow { min: u32, max: u32 },
    NotFound,
}

/// `mtus` ascending, `ok[i]` the outcome of `mtus[i]`.
pub fn interpret_round(mtus: &[u32], ok: &[bool]) -> RoundVerdict {
    debug_assert_eq!(mtus.len(), ok.len());
    match ok.last() {
        None => return RoundVerdict::NotFound,
        Some(true) => return RoundVerdict::Found(mtus[mtus.len() - 1]),
        Some(false) => {}
    }
    // highest accepted candidate below the (rejected) ceiling
    match (0..mtus.len() - 1).rev().find(|&i| ok[i]) {
        None => RoundVerdict::NotFound,
        Some(i) if mtus[i + 1] - 1 == mtus[i] => RoundVerdict::Found(mtus[i]),
        Some(i) => RoundVerdict::Narrow { min: mtus[i], max: mtus[i + 1] - 1 },
    }
}

/// How long rounds may take: each one `per_try`, all of them together no
/// later than `deadline`.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub per_try: Duration,
    pub deadline: Option<Instant>,
}

impl Timing {
    pub fn per_try(per_try: Duration) -> Timing {
        Timing { per_try, deadline: None }
    }

    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Deadline of a round starting now, cut short by the overall one.
    pub fn round_deadline(&self) -> Result<Instant> {
        if self.expired() {
            return Err(Error::DeadlineExceeded);
        }
        let round = Instant::now() + self.per_try;
        Ok(self.deadline.map_or(round, |deadline| deadline.min(round)))
    }

    /// Outcomes of a round that ran into the overall deadline cannot be trusted.
    pub fn check_round<T>(&self, outcome: T) -> Result<T> {
        if self.expired() {
            return Err(Error::DeadlineExceeded);
        }
        Ok(outcome)
    }
}

/// Run rounds until one pins the MTU down. `round` gets the candidates of a round
/// and returns one success flag per candidate, in the same order. An error from
/// `round` ends the search.
pub fn search<F>(min_mtu: u32, max_mtu: u32, round: &mut F) -> Result<u32>
where F: FnMut(&[u32]) -> Result<Vec<bool>> {
    let mtus = make_mtus_to_test(min_mtu, max_mtu)?;
    let ok = round(&mtus)?;
    debug!("Round [{min_mtu}, {max_mtu}]: {:?}",
           mtus.iter().zip(&ok).collect::<Vec<_>>());

    match interpret_round(&mtus, &ok) {
        RoundVerdict::Found(mtu) => Ok(mtu),
        RoundVerdict::Narrow { min, max } => search(min, max, round),
        RoundVerdict::NotFound => Err(Error::MtuNotFound),
    }
}
