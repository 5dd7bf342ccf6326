use crate::error::IdError;

/// Which end of a connection a session plays.
///
/// The role fixes the identifier partition: the initiator allocates odd
/// identifiers and the acceptor even ones, so both ends can open streams
/// concurrently without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Acceptor,
}

impl Role {
    /// The role played by the other end.
    pub fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Acceptor,
            Role::Acceptor => Role::Initiator,
        }
    }

    pub fn parity(self) -> Parity {
        match self {
            Role::Initiator => Parity::Odd,
            Role::Acceptor => Parity::Even,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Acceptor => f.write_str("acceptor"),
        }
    }
}

/// Half of the identifier space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    /// 1, 3, 5, ...
    Odd,
    /// 2, 4, 6, ...
    Even,
}

impl Parity {
    fn first(self) -> u32 {
        match self {
            Parity::Odd => 1,
            Parity::Even => 2,
        }
    }
}

/// Strictly increasing identifier sequence with a step of 2.
///
/// A session owns two of these: one for identifiers it assigns and one,
/// with the peer's parity, for identifiers it accepts.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    // None once the sequence has run past u32::MAX.
    next: Option<u32>,
}

impl IdAllocator {
    pub fn new(parity: Parity) -> Self {
        Self {
            next: Some(parity.first()),
        }
    }

    /// The identifier the next registration will produce.
    pub fn peek(&self) -> Result<u32, IdError> {
        self.next.ok_or(IdError::Overflow)
    }

    /// Allocate the next identifier.
    pub fn next(&mut self) -> Result<u32, IdError> {
        self.register(0)
    }

    /// Accept `proposed` if it is the next identifier in sequence.
    ///
    /// `0` auto-assigns. A rejected proposal leaves the sequence unchanged.
    pub fn register(&mut self, proposed: u32) -> Result<u32, IdError> {
        let expected = self.peek()?;
        if proposed != 0 && proposed != expected {
            return Err(IdError::Unexpected {
                got: proposed,
                expected,
            });
        }
        self.next = expected.checked_add(2);
        Ok(expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_are_partitioned_by_role() {
        let mut initiator = IdAllocator::new(Role::Initiator.parity());
        let mut acceptor = IdAllocator::new(Role::Acceptor.parity());

        let odd: Vec<u32> = (0..4).map(|_| initiator.next().unwrap()).collect();
        let even: Vec<u32> = (0..4).map(|_| acceptor.next().unwrap()).collect();
        assert_eq!(odd, [1, 3, 5, 7]);
        assert_eq!(even, [2, 4, 6, 8]);
    }

    #[test]
    fn register_accepts_only_the_next_id() {
        let mut ids = IdAllocator::new(Parity::Even);
        assert_eq!(ids.register(2).unwrap(), 2);
        assert_eq!(
            ids.register(2),
            Err(IdError::Unexpected {
                got: 2,
                expected: 4
            })
        );
        assert_eq!(
            ids.register(8),
            Err(IdError::Unexpected {
                got: 8,
                expected: 4
            })
        );
        // Failed registrations don't advance the sequence.
        assert_eq!(ids.register(0).unwrap(), 4);
        assert_eq!(ids.peek().unwrap(), 6);
    }

    #[test]
    fn overflow_is_fatal() {
        let mut odd = IdAllocator {
            next: Some(u32::MAX - 2),
        };
        assert_eq!(odd.next().unwrap(), u32::MAX - 2);
        assert_eq!(odd.next().unwrap(), u32::MAX);
        assert_eq!(odd.next(), Err(IdError::Overflow));
        assert_eq!(odd.register(0), Err(IdError::Overflow));

        let mut even = IdAllocator {
            next: Some(u32::MAX - 1),
        };
        assert_eq!(even.next().unwrap(), u32::MAX - 1);
        assert_eq!(even.next(), Err(IdError::Overflow));
    }

    #[test]
    fn role_peer_swaps() {
        assert_eq!(Role::Initiator.peer(), Role::Acceptor);
        assert_eq!(Role::Acceptor.peer().parity(), Parity::Odd);
    }
}
