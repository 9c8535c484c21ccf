use super::handle::ParticipantHandle;
use std::collections::HashMap;
use std::fmt::Write as _;
use tracing::trace;

/// Identifies the media engine a participant's audio flows through.
/// Only participants on the same interface can be mixed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaInterfaceId(pub u64);

#[derive(Debug, Clone, Copy)]
struct Port {
    interface: MediaInterfaceId,
    input_gain: u32,
    output_gain: u32,
}

/// The audio cross-connect: cell (i, j) is the gain applied from
/// participant i's output into participant j's input.
///
/// Invariants: the diagonal is always zero (no self feedback) and every
/// weight stays inside 0..=100. The matrix is recomputed after every
/// membership or gain change.
pub struct BridgeMixer {
    ports: HashMap<ParticipantHandle, Port>,
    order: Vec<ParticipantHandle>,
    weights: Vec<Vec<u32>>,
}

impl BridgeMixer {
    pub fn new() -> Self {
        BridgeMixer {
            ports: HashMap::new(),
            order: Vec::new(),
            weights: Vec::new(),
        }
    }

    pub fn add_port(&mut self, handle: ParticipantHandle, interface: MediaInterfaceId) {
        if self.ports.contains_key(&handle) {
            return;
        }
        self.ports.insert(
            handle,
            Port {
                interface,
                input_gain: 100,
                output_gain: 100,
            },
        );
        self.order.push(handle);
        self.recompute();
    }

    pub fn remove_port(&mut self, handle: ParticipantHandle) {
        if self.ports.remove(&handle).is_some() {
            self.order.retain(|h| *h != handle);
            self.recompute();
        }
    }

    pub fn set_gains(&mut self, handle: ParticipantHandle, input_gain: u32, output_gain: u32) {
        if let Some(port) = self.ports.get_mut(&handle) {
            port.input_gain = input_gain.min(100);
            port.output_gain = output_gain.min(100);
            self.recompute();
        }
    }

    pub fn contains(&self, handle: ParticipantHandle) -> bool {
        self.ports.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// weight = input_gain(i) * output_gain(j) / 100, clamped to 0..=100;
    /// zero across interface boundaries and on the diagonal.
    fn recompute(&mut self) {
        let n = self.order.len();
        let mut weights = vec![vec![0u32; n]; n];
        for (i, from) in self.order.iter().enumerate() {
            for (j, to) in self.order.iter().enumerate() {
                if i == j {
                    continue;
                }
                let (a, b) = match (self.ports.get(from), self.ports.get(to)) {
                    (Some(a), Some(b)) => (a, b),
                    _ => continue,
                };
                if a.interface != b.interface {
                    continue;
                }
                weights[i][j] = (a.input_gain * b.output_gain / 100).min(100);
            }
        }
        self.weights = weights;
        trace!("bridge matrix recomputed for {} ports", n);
    }

    pub fn weight(&self, from: ParticipantHandle, to: ParticipantHandle) -> u32 {
        let i = self.order.iter().position(|h| *h == from);
        let j = self.order.iter().position(|h| *h == to);
        match (i, j) {
            (Some(i), Some(j)) => self.weights[i][j],
            _ => 0,
        }
    }

    /// Multiline dump of the matrix, rows labelled by participant
    /// handle, for `output_bridge_matrix`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        write!(out, "{:>12}", "").ok();
        for h in &self.order {
            write!(out, "{:>12}", h.to_string()).ok();
        }
        out.push('\n');
        for (i, from) in self.order.iter().enumerate() {
            write!(out, "{:>12}", from.to_string()).ok();
            for j in 0..self.order.len() {
                write!(out, "{:>12}", self.weights[i][j]).ok();
            }
            out.push('\n');
        }
        out
    }
}

impl Default for BridgeMixer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IFACE: MediaInterfaceId = MediaInterfaceId(1);

    #[test]
    fn test_diagonal_is_zero() {
        let mut mixer = BridgeMixer::new();
        let a = ParticipantHandle(1);
        let b = ParticipantHandle(2);
        mixer.add_port(a, IFACE);
        mixer.add_port(b, IFACE);
        assert_eq!(mixer.weight(a, a), 0);
        assert_eq!(mixer.weight(b, b), 0);
        assert_eq!(mixer.weight(a, b), 100);
    }

    #[test]
    fn test_gain_product_and_clamp() {
        let mut mixer = BridgeMixer::new();
        let a = ParticipantHandle(1);
        let b = ParticipantHandle(2);
        mixer.add_port(a, IFACE);
        mixer.add_port(b, IFACE);
        mixer.set_gains(a, 50, 100);
        mixer.set_gains(b, 100, 80);
        // a -> b: input(a)=50 * output(b)=80 / 100 = 40
        assert_eq!(mixer.weight(a, b), 40);
        // b -> a: input(b)=100 * output(a)=100 / 100 = 100
        assert_eq!(mixer.weight(b, a), 100);

        mixer.set_gains(a, 500, 500);
        assert_eq!(mixer.weight(a, b), 80);
    }

    #[test]
    fn test_interface_isolation() {
        let mut mixer = BridgeMixer::new();
        let a = ParticipantHandle(1);
        let b = ParticipantHandle(2);
        mixer.add_port(a, MediaInterfaceId(1));
        mixer.add_port(b, MediaInterfaceId(2));
        assert_eq!(mixer.weight(a, b), 0);
        assert_eq!(mixer.weight(b, a), 0);
    }

    #[test]
    fn test_remove_recomputes() {
        let mut mixer = BridgeMixer::new();
        let a = ParticipantHandle(1);
        let b = ParticipantHandle(2);
        mixer.add_port(a, IFACE);
        mixer.add_port(b, IFACE);
        mixer.remove_port(b);
        assert!(!mixer.contains(b));
        assert_eq!(mixer.weight(a, b), 0);
        assert_eq!(mixer.len(), 1);
    }

    #[test]
    fn test_render_labels_rows() {
        let mut mixer = BridgeMixer::new();
        mixer.add_port(ParticipantHandle(7), IFACE);
        mixer.add_port(ParticipantHandle(9), IFACE);
        let out = mixer.render();
        assert!(out.contains("part:7"));
        assert!(out.contains("part:9"));
        assert_eq!(out.lines().count(), 3);
    }
}
