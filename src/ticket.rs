//! Turn ordering.
//!
//! Every agent holds a [`Ticket`]. The agent with the smallest ticket moves next, which
//! gives a weighted round-robin: an agent with half the move delay of another moves
//! about twice as often. All "times" here are abstract and have no unit.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::AgentIndex;

/// An agent's place in the turn order.
///
/// Ordered by `next_time`, then `last_time`, then `num_moves` (smaller is more eligible).
/// The derived ordering relies on the field declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ticket {
    /// The next time the agent is allowed to move.
    pub next_time: i64,
    /// The last time the agent moved.
    pub last_time: i64,
    /// How many times the agent moved so far.
    pub num_moves: u64,
}

impl Ticket {
    /// Create a ticket from its three fields.
    pub const fn new(next_time: i64, last_time: i64, num_moves: u64) -> Self {
        Self {
            next_time,
            last_time,
            num_moves,
        }
    }

    /// The ticket an agent starts a game with: eligible after one delay, never moved.
    pub fn initial(move_delay: u32) -> Self {
        Self::new(i64::from(move_delay), 0, 0)
    }

    /// The ticket that follows this one once the agent has moved.
    #[must_use]
    pub fn next(&self, move_delay: u32) -> Self {
        Self {
            next_time: self.next_time + i64::from(move_delay),
            last_time: self.next_time,
            num_moves: self.num_moves + 1,
        }
    }
}

/// Pick the agent holding the smallest ticket.
///
/// Equal tickets are resolved by iteration order, which for a `BTreeMap` is ascending
/// agent index and therefore stable from call to call.
/// Returns `None` only when `tickets` is empty.
pub fn select_next(tickets: &BTreeMap<AgentIndex, Ticket>) -> Option<AgentIndex> {
    let mut best: Option<(AgentIndex, &Ticket)> = None;
    for (agent_index, ticket) in tickets {
        match best {
            // strict comparison keeps the first of equal tickets
            Some((_, best_ticket)) if ticket >= best_ticket => {}
            _ => best = Some((*agent_index, ticket)),
        }
    }
    best.map(|(agent_index, _)| agent_index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_lexicographic() {
        // (lower, higher)
        let cases = [
            (Ticket::new(0, 0, 0), Ticket::new(1, 0, 0)),
            (Ticket::new(0, 0, 0), Ticket::new(0, 1, 0)),
            (Ticket::new(0, 0, 0), Ticket::new(0, 0, 1)),
            (Ticket::new(0, 9, 9), Ticket::new(1, 0, 0)),
            (Ticket::new(0, 0, 9), Ticket::new(0, 1, 0)),
            (Ticket::new(-1, 0, 0), Ticket::new(1, 0, 0)),
        ];

        for (i, (lower, higher)) in cases.iter().enumerate() {
            assert!(lower < higher, "case {i}: {lower:?} < {higher:?}");
            assert!(higher > lower, "case {i}: {higher:?} > {lower:?}");
        }
    }

    #[test]
    fn ordering_is_total() {
        let values = [-1, 0, 1];
        let mut tickets = vec![];
        for a in values {
            for b in values {
                for c in [0, 1, 2] {
                    tickets.push(Ticket::new(a, b, c));
                }
            }
        }

        for a in &tickets {
            for b in &tickets {
                let smaller = [a < b, b < a].iter().filter(|x| **x).count();
                if a == b {
                    assert_eq!(smaller, 0);
                } else {
                    assert_eq!(smaller, 1, "{a:?} vs {b:?}");
                }
            }
        }
    }

    #[test]
    fn next_ticket() {
        let ticket = Ticket::initial(100);
        assert_eq!(ticket, Ticket::new(100, 0, 0));

        let ticket = ticket.next(100);
        assert_eq!(ticket, Ticket::new(200, 100, 1));

        let ticket = ticket.next(50);
        assert_eq!(ticket, Ticket::new(250, 200, 2));
    }

    #[test]
    fn select_smallest() {
        let tickets = BTreeMap::from([
            (0, Ticket::new(300, 0, 0)),
            (1, Ticket::new(100, 0, 0)),
            (2, Ticket::new(200, 0, 0)),
        ]);
        assert_eq!(select_next(&tickets), Some(1));
        assert_eq!(select_next(&BTreeMap::new()), None);
    }

    #[test]
    fn equal_tickets_use_iteration_order() {
        let tickets = BTreeMap::from([(3, Ticket::new(5, 5, 5)), (7, Ticket::new(5, 5, 5))]);
        for _ in 0..10 {
            assert_eq!(select_next(&tickets), Some(3));
        }
    }

    #[test]
    fn alternation_trace() {
        let delays = BTreeMap::from([(0, 100), (1, 200)]);
        let mut tickets: BTreeMap<AgentIndex, Ticket> = delays
            .iter()
            .map(|(agent, delay)| (*agent, Ticket::initial(*delay)))
            .collect();

        let mut order = vec![];
        for _ in 0..3 {
            let agent = select_next(&tickets).unwrap();
            let ticket = tickets[&agent].next(delays[&agent]);
            tickets.insert(agent, ticket);
            order.push(agent);
        }

        // after agent 0 moves once, (200,0,0) beats (200,100,1) on last_time
        assert_eq!(order, vec![0, 1, 0]);
        assert_eq!(tickets[&0], Ticket::new(300, 200, 2));
        assert_eq!(tickets[&1], Ticket::new(400, 200, 1));
    }

    #[test]
    fn fairness_follows_delay_ratio() {
        let delays = BTreeMap::from([(0, 50), (1, 150)]);
        let mut tickets: BTreeMap<AgentIndex, Ticket> = delays
            .iter()
            .map(|(agent, delay)| (*agent, Ticket::initial(*delay)))
            .collect();

        let mut counts = BTreeMap::<AgentIndex, u32>::new();
        for _ in 0..4000 {
            let agent = select_next(&tickets).unwrap();
            let ticket = tickets[&agent].next(delays[&agent]);
            tickets.insert(agent, ticket);
            *counts.entry(agent).or_default() += 1;
        }

        // 3:1 split, exact up to one turn of rounding
        assert!((2999..=3001).contains(&counts[&0]), "{counts:?}");
        assert!((999..=1001).contains(&counts[&1]), "{counts:?}");
    }
}
