//! Rarest-first piece selection with endgame duplication.
//!
//! All state lives behind a single mutex: the picker is one critical
//! section, so `observe_*`, `next*`, `done`, and `requeue` linearize
//! against each other regardless of how many peer connections call in.
use crate::bitfield::Bitfield;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PieceState {
    Needed,
    InFlight,
    Done,
}

struct Inner {
    state: Vec<PieceState>,
    availability: Vec<u32>,
    remaining: usize,
}

pub struct PiecePicker {
    inner: Mutex<Inner>,
}

impl PiecePicker {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: vec![PieceState::Needed; num_pieces],
                availability: vec![0; num_pieces],
                remaining: num_pieces,
            }),
        }
    }

    /// Builds a picker that already considers the set bits of `have` done,
    /// for resuming from a persisted bitfield.
    pub fn with_resumed(have: &Bitfield) -> Self {
        let num_pieces = have.len();
        let mut state = vec![PieceState::Needed; num_pieces];
        let mut remaining = num_pieces;
        for i in 0..num_pieces {
            if have.is_set(i) {
                state[i] = PieceState::Done;
                remaining -= 1;
            }
        }
        Self {
            inner: Mutex::new(Inner {
                state,
                availability: vec![0; num_pieces],
                remaining,
            }),
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.inner.lock().unwrap().state.len()
    }

    pub fn observe_bitfield(&self, bf: &Bitfield) {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.availability.len();
        for i in 0..n.min(bf.len()) {
            if bf.is_set(i) {
                inner.availability[i] += 1;
            }
        }
    }

    pub fn observe_have(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(count) = inner.availability.get_mut(index) {
            *count += 1;
        }
    }

    /// Picks the globally rarest `needed` piece, ignoring any particular
    /// peer's bitfield. Marks it in-flight.
    pub fn next(&self) -> Option<usize> {
        let mut inner = self.inner.lock().unwrap();
        let pick = inner
            .state
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == PieceState::Needed)
            .min_by_key(|(i, _)| (inner.availability[*i], *i))
            .map(|(i, _)| i);
        if let Some(index) = pick {
            inner.state[index] = PieceState::InFlight;
        }
        pick
    }

    /// Among pieces set in `bf` and still `needed`, returns the one with
    /// the smallest availability (rarest-first), ties broken by index.
    pub fn next_from_bitfield(&self, bf: &Bitfield) -> Option<usize> {
        let mut inner = self.inner.lock().unwrap();
        let pick = Self::rarest_candidate(&inner, bf, false);
        if let Some(index) = pick {
            inner.state[index] = PieceState::InFlight;
        }
        pick
    }

    /// Like [`next_from_bitfield`] but, once endgame is active, may also
    /// return a piece already `in-flight` (duplicate request) provided
    /// `bf` has it set.
    pub fn next_from_bitfield_endgame(&self, bf: &Bitfield) -> Option<usize> {
        let mut inner = self.inner.lock().unwrap();
        if !Self::is_endgame(&inner) {
            let pick = Self::rarest_candidate(&inner, bf, false);
            if let Some(index) = pick {
                inner.state[index] = PieceState::InFlight;
            }
            return pick;
        }
        Self::rarest_candidate(&inner, bf, true)
    }

    fn rarest_candidate(inner: &Inner, bf: &Bitfield, allow_in_flight: bool) -> Option<usize> {
        inner
            .state
            .iter()
            .enumerate()
            .filter(|(i, s)| {
                bf.is_set(*i)
                    && (**s == PieceState::Needed || (allow_in_flight && **s == PieceState::InFlight))
            })
            .min_by_key(|(i, _)| (inner.availability[*i], *i))
            .map(|(i, _)| i)
    }

    pub fn done(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.get(index) != Some(&PieceState::Done) {
            if let Some(state) = inner.state.get_mut(index) {
                *state = PieceState::Done;
                inner.remaining -= 1;
            }
        }
    }

    /// If `index` is in-flight, marks it needed again. No-op if already
    /// done.
    pub fn requeue(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.state.get_mut(index) {
            if *state == PieceState::InFlight {
                *state = PieceState::Needed;
            }
        }
    }

    pub fn remaining(&self) -> usize {
        self.inner.lock().unwrap().remaining
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    fn is_endgame(inner: &Inner) -> bool {
        inner.remaining <= (inner.state.len() / 20).max(2)
    }

    pub fn endgame_active(&self) -> bool {
        Self::is_endgame(&self.inner.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_bitfield(n: usize) -> Bitfield {
        let mut bf = Bitfield::new(n);
        for i in 0..n {
            bf.set(i);
        }
        bf
    }

    #[test]
    fn next_from_bitfield_prefers_rarest() {
        let picker = PiecePicker::new(3);
        let bf = full_bitfield(3);
        // Piece 1 is rarest (availability 0), others get observed twice.
        picker.observe_have(0);
        picker.observe_have(0);
        picker.observe_have(2);
        picker.observe_have(2);

        let pick = picker.next_from_bitfield(&bf).unwrap();
        assert_eq!(pick, 1);
    }

    #[test]
    fn ties_broken_by_smallest_index() {
        let picker = PiecePicker::new(3);
        let bf = full_bitfield(3);
        let pick = picker.next_from_bitfield(&bf).unwrap();
        assert_eq!(pick, 0);
    }

    #[test]
    fn done_is_idempotent_and_decrements_remaining_once() {
        let picker = PiecePicker::new(2);
        assert_eq!(picker.remaining(), 2);
        picker.done(0);
        assert_eq!(picker.remaining(), 1);
        picker.done(0);
        assert_eq!(picker.remaining(), 1);
    }

    #[test]
    fn requeue_only_affects_in_flight_pieces() {
        let picker = PiecePicker::new(2);
        let bf = full_bitfield(2);
        let picked = picker.next_from_bitfield(&bf).unwrap();
        picker.requeue(picked);
        // picked again since it went back to needed.
        let picked_again = picker.next_from_bitfield(&bf).unwrap();
        assert_eq!(picked, picked_again);

        picker.done(picked);
        picker.requeue(picked);
        assert_eq!(picker.remaining(), 1);
    }

    #[test]
    fn endgame_activates_near_completion() {
        let picker = PiecePicker::new(10);
        for i in 0..8 {
            picker.done(i);
        }
        // remaining = 2, max(10/20, 2) = 2 -> endgame active.
        assert!(picker.endgame_active());
    }

    #[test]
    fn endgame_allows_duplicate_in_flight_pick() {
        let picker = PiecePicker::new(2);
        let bf = full_bitfield(2);
        let first = picker.next_from_bitfield_endgame(&bf).unwrap();
        // remaining = 2, max(2/20,2) = 2 -> already endgame.
        let second = picker.next_from_bitfield_endgame(&bf).unwrap();
        assert!(second == first || bf.is_set(second));
    }

    #[test]
    fn with_resumed_marks_existing_bits_done() {
        let mut have = Bitfield::new(4);
        have.set(0);
        have.set(2);
        let picker = PiecePicker::with_resumed(&have);
        assert_eq!(picker.remaining(), 2);
    }
}
