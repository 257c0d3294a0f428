//! Leaky integrate-and-fire network with Hebbian and STDP plasticity.
//!
//! Neurons `0..256` receive the input encoding, neurons `256..512` represent
//! the target encoding, and any further neurons are hidden. Connections are
//! directed and sparse; weights stay in `[-1, 1]`.

use std::collections::{BTreeMap, VecDeque};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::encoding::ENCODING_DIM;
use crate::config::FastLearnerSettings;

/// Activity threshold on `encoding * input_gain`.
const ACTIVE_THRESHOLD: f32 = 0.5;

/// A single neuron.
#[derive(Debug, Clone, PartialEq)]
pub struct Neuron {
    /// Index in the network.
    pub id: usize,
    /// Current membrane potential.
    pub membrane_potential: f32,
    /// Step of the most recent spike; `None` means it never fired.
    pub last_spike_time: Option<u64>,
    /// Outgoing connections: target id to weight.
    pub connections: BTreeMap<usize, f32>,
    /// Recent spike steps, oldest first.
    pub spike_history: VecDeque<u64>,
}

impl Neuron {
    fn new(id: usize) -> Self {
        Self {
            id,
            membrane_potential: 0.0,
            last_spike_time: None,
            connections: BTreeMap::new(),
            spike_history: VecDeque::new(),
        }
    }

    /// Whether the neuron is still recovering from a spike at step `now`.
    #[must_use]
    pub fn is_refractory(&self, now: u64, period: u64) -> bool {
        self.last_spike_time
            .is_some_and(|t| now.saturating_sub(t) < period)
    }
}

/// Directed connection, used for export.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Source neuron.
    pub from: u32,
    /// Target neuron.
    pub to: u32,
    /// Weight in `[-1, 1]`.
    pub weight: f32,
}

/// Network dynamics parameters.
#[derive(Debug, Clone)]
struct Dynamics {
    threshold: f32,
    leak_rate: f32,
    refractory_period: u64,
    steps: usize,
    stdp_enabled: bool,
    stdp_window: u64,
    stdp_tau: f32,
    a_plus: f32,
    a_minus: f32,
    history_len: usize,
    input_gain: f32,
}

/// Read-only projection of network counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkStats {
    /// Number of neurons.
    pub neurons: usize,
    /// Number of directed connections.
    pub connections: usize,
    /// Mean connection weight.
    pub mean_weight: f32,
    /// Simulation steps run so far.
    pub time_step: u64,
}

/// The spiking network.
#[derive(Debug, Clone)]
pub struct SpikingNetwork {
    neurons: Vec<Neuron>,
    time: u64,
    dynamics: Dynamics,
}

impl SpikingNetwork {
    /// Build a randomly connected network.
    #[must_use]
    pub fn new(settings: &FastLearnerSettings) -> Self {
        let n = settings.neuron_count.max(2 * ENCODING_DIM);
        let mut neurons: Vec<Neuron> = (0..n).map(Neuron::new).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
        for (i, neuron) in neurons.iter_mut().enumerate() {
            for j in 0..n {
                if i != j && rng.gen::<f32>() < settings.connection_density {
                    neuron.connections.insert(j, rng.gen_range(-0.2..0.2));
                }
            }
        }

        Self {
            neurons,
            time: 0,
            dynamics: Dynamics {
                threshold: settings.firing_threshold,
                leak_rate: settings.leak_rate,
                refractory_period: settings.refractory_period,
                steps: settings.simulation_steps,
                stdp_enabled: settings.stdp_enabled,
                stdp_window: settings.stdp_window,
                stdp_tau: settings.stdp_tau,
                a_plus: settings.stdp_a_plus,
                a_minus: settings.stdp_a_minus,
                history_len: settings.spike_history_len,
                input_gain: settings.input_gain,
            },
        }
    }

    /// All neurons.
    #[must_use]
    pub fn neurons(&self) -> &[Neuron] {
        &self.neurons
    }

    /// Global simulation step counter.
    #[must_use]
    pub fn time(&self) -> u64 {
        self.time
    }

    /// Weight of `from -> to`, if the connection exists.
    #[must_use]
    pub fn weight(&self, from: usize, to: usize) -> Option<f32> {
        self.neurons.get(from)?.connections.get(&to).copied()
    }

    fn active_indices(&self, encoding: &[f32]) -> Vec<usize> {
        encoding
            .iter()
            .take(ENCODING_DIM)
            .enumerate()
            .filter(|&(_, &v)| v * self.dynamics.input_gain > ACTIVE_THRESHOLD)
            .map(|(i, _)| i)
            .collect()
    }

    /// Run the simulation on an input encoding and return the normalised firing
    /// histogram of the target-representation neurons.
    #[allow(clippy::cast_precision_loss)]
    pub fn forward(&mut self, input: &[f32]) -> Vec<f32> {
        let gain = self.dynamics.input_gain;
        let current: Vec<f32> = input.iter().take(ENCODING_DIM).map(|v| v * gain).collect();

        let mut counts = vec![0u32; ENCODING_DIM];
        for _ in 0..self.dynamics.steps {
            let spiked = self.step(&current);
            for id in spiked {
                if (ENCODING_DIM..2 * ENCODING_DIM).contains(&id) {
                    counts[id - ENCODING_DIM] += 1;
                }
            }
        }

        let total: u32 = counts.iter().sum();
        if total == 0 {
            return vec![0.0; ENCODING_DIM];
        }
        counts
            .into_iter()
            .map(|c| c as f32 / total as f32)
            .collect()
    }

    /// One simulation step with a constant input current on the input neurons.
    /// Returns the ids that spiked.
    fn step(&mut self, current: &[f32]) -> Vec<usize> {
        self.time += 1;
        let now = self.time;
        let d = &self.dynamics;

        let mut spiked = Vec::new();
        for neuron in &mut self.neurons {
            neuron.membrane_potential *= 1.0 - d.leak_rate;
            if let Some(&i) = current.get(neuron.id) {
                neuron.membrane_potential += i;
            }
            if neuron.is_refractory(now, d.refractory_period) {
                continue;
            }
            if neuron.membrane_potential >= d.threshold {
                neuron.membrane_potential = 0.0;
                neuron.last_spike_time = Some(now);
                neuron.spike_history.push_back(now);
                while neuron.spike_history.len() > d.history_len {
                    neuron.spike_history.pop_front();
                }
                spiked.push(neuron.id);
            }
        }

        let mut currents: Vec<(usize, f32)> = Vec::new();
        for &id in &spiked {
            currents.extend(self.neurons[id].connections.iter().map(|(&t, &w)| (t, w)));
        }
        for (target, w) in currents {
            self.neurons[target].membrane_potential += w;
        }

        if self.dynamics.stdp_enabled && !spiked.is_empty() {
            self.apply_stdp(&spiked);
        }
        spiked
    }

    /// Adjust every connection touching a neuron that just spiked.
    fn apply_stdp(&mut self, spiked: &[usize]) {
        let fired_now: Vec<bool> = {
            let mut v = vec![false; self.neurons.len()];
            for &id in spiked {
                v[id] = true;
            }
            v
        };
        let last: Vec<Option<u64>> = self.neurons.iter().map(|n| n.last_spike_time).collect();
        let d = &self.dynamics;

        for pre in 0..self.neurons.len() {
            let Some(t_pre) = last[pre] else { continue };
            for (&post, w) in &mut self.neurons[pre].connections {
                if !(fired_now[pre] || fired_now[post]) {
                    continue;
                }
                let Some(t_post) = last[post] else { continue };
                #[allow(clippy::cast_possible_wrap)]
                let dt = t_post as i64 - t_pre as i64;
                if dt == 0 || dt.unsigned_abs() > d.stdp_window {
                    continue;
                }
                #[allow(clippy::cast_precision_loss)]
                let decay = (-(dt.unsigned_abs() as f32) / d.stdp_tau).exp();
                let delta = if dt > 0 {
                    d.a_plus * decay
                } else {
                    -d.a_minus * decay
                };
                *w = (*w + delta).clamp(-1.0, 1.0);
            }
        }
    }

    /// Strengthen every active-input to active-target pair by `rate`, capped at 1.
    ///
    /// Missing connections are created. Returns the number of pairs touched.
    pub fn hebbian_learning(&mut self, input: &[f32], target: &[f32], rate: f32) -> usize {
        let pre = self.active_indices(input);
        let post: Vec<usize> = self
            .active_indices(target)
            .into_iter()
            .map(|j| j + ENCODING_DIM)
            .collect();

        for &i in &pre {
            let connections = &mut self.neurons[i].connections;
            for &j in &post {
                let w = connections.entry(j).or_insert(0.0);
                *w = (*w + rate).min(1.0);
            }
        }
        pre.len() * post.len()
    }

    /// Remove connections with `|w| < threshold`. Returns how many were removed.
    pub fn prune_connections(&mut self, threshold: f32) -> usize {
        let mut removed = 0;
        for neuron in &mut self.neurons {
            let before = neuron.connections.len();
            neuron.connections.retain(|_, w| w.abs() >= threshold);
            removed += before - neuron.connections.len();
        }
        if removed > 0 {
            debug!(removed, threshold, "pruned weak connections");
        }
        removed
    }

    /// Flatten all connections.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn export_connections(&self) -> Vec<Connection> {
        self.neurons
            .iter()
            .flat_map(|n| {
                n.connections.iter().map(move |(&to, &weight)| Connection {
                    from: n.id as u32,
                    to: to as u32,
                    weight,
                })
            })
            .collect()
    }

    /// Replace all connections. Out-of-range endpoints are skipped.
    pub fn import_connections(&mut self, connections: &[Connection]) {
        for neuron in &mut self.neurons {
            neuron.connections.clear();
        }
        let n = self.neurons.len();
        for c in connections {
            let (from, to) = (c.from as usize, c.to as usize);
            if from < n && to < n {
                self.neurons[from]
                    .connections
                    .insert(to, c.weight.clamp(-1.0, 1.0));
            }
        }
    }

    /// Counters.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> NetworkStats {
        let (count, sum) = self
            .neurons
            .iter()
            .flat_map(|n| n.connections.values())
            .fold((0usize, 0.0f32), |(c, s), &w| (c + 1, s + w));
        NetworkStats {
            neurons: self.neurons.len(),
            connections: count,
            mean_weight: if count == 0 { 0.0 } else { sum / count as f32 },
            time_step: self.time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fast_learner::encode_text;

    fn settings() -> FastLearnerSettings {
        FastLearnerSettings::default()
    }

    #[test]
    fn test_initial_density_and_bounds() {
        let net = SpikingNetwork::new(&settings());
        let stats = net.stats();
        assert_eq!(stats.neurons, 512);
        // ~10% of 512 * 511
        assert!(stats.connections > 20_000 && stats.connections < 32_000);
        assert!(net
            .export_connections()
            .iter()
            .all(|c| (-1.0..=1.0).contains(&c.weight) && c.from != c.to));
    }

    #[test]
    fn test_same_seed_same_network() {
        let a = SpikingNetwork::new(&settings());
        let b = SpikingNetwork::new(&settings());
        assert_eq!(a.export_connections(), b.export_connections());
    }

    #[test]
    fn test_hebbian_strengthens_pairs_and_caps() {
        let mut net = SpikingNetwork::new(&settings());
        let input = encode_text("ab");
        let target = encode_text("c");
        let touched = net.hebbian_learning(&input, &target, 0.01);
        assert_eq!(touched, 2);

        let t = ENCODING_DIM + b'c' as usize;
        let before = net.weight(b'a' as usize, t).unwrap();
        net.hebbian_learning(&input, &target, 0.01);
        let after = net.weight(b'a' as usize, t).unwrap();
        assert!((after - (before + 0.01).min(1.0)).abs() < 1e-6);

        for _ in 0..300 {
            net.hebbian_learning(&input, &target, 0.01);
        }
        assert_eq!(net.weight(b'a' as usize, t), Some(1.0));
    }

    #[test]
    fn test_refractory_and_reset() {
        let mut n = Neuron::new(0);
        assert!(!n.is_refractory(5, 2));
        n.last_spike_time = Some(5);
        assert!(n.is_refractory(5, 2));
        assert!(n.is_refractory(6, 2));
        assert!(!n.is_refractory(7, 2));
    }

    #[test]
    fn test_forward_advances_time_and_normalises() {
        let mut net = SpikingNetwork::new(&settings());
        let input = encode_text("aaaa");
        let target = encode_text("bbbb");
        for _ in 0..100 {
            net.hebbian_learning(&input, &target, 0.01);
        }
        let pred = net.forward(&input);
        assert_eq!(net.time(), 10);
        assert_eq!(pred.len(), ENCODING_DIM);
        let sum: f32 = pred.iter().sum();
        assert!(sum == 0.0 || (sum - 1.0).abs() < 1e-4);
        assert!(pred[b'b' as usize] > 0.0);
        assert!(net
            .neurons()
            .iter()
            .all(|n| n.spike_history.len() <= 100));
    }

    #[test]
    fn test_stdp_keeps_weights_bounded() {
        let mut net = SpikingNetwork::new(&settings());
        let input = encode_text("hello world");
        for _ in 0..20 {
            net.forward(&input);
        }
        assert!(net
            .export_connections()
            .iter()
            .all(|c| (-1.0..=1.0).contains(&c.weight)));
    }

    #[test]
    fn test_stdp_sign_decay_and_window() {
        let cfg = settings();
        let mut net = SpikingNetwork::new(&cfg);
        net.import_connections(&[
            Connection { from: 1, to: 2, weight: 0.0 },
            Connection { from: 3, to: 4, weight: 0.0 },
            Connection { from: 5, to: 6, weight: 0.0 },
        ]);

        let now = cfg.stdp_window + 50;
        // 1 fired 3 steps before 2.
        net.neurons[1].last_spike_time = Some(now - 3);
        net.neurons[2].last_spike_time = Some(now);
        // 4 fired 2 steps before 3.
        net.neurons[3].last_spike_time = Some(now);
        net.neurons[4].last_spike_time = Some(now - 2);
        // 6 fired just outside the window.
        net.neurons[5].last_spike_time = Some(now);
        net.neurons[6].last_spike_time = Some(now - cfg.stdp_window - 1);

        net.apply_stdp(&[2, 3, 5]);

        let potentiated = cfg.stdp_a_plus * (-3.0 / cfg.stdp_tau).exp();
        let depressed = -cfg.stdp_a_minus * (-2.0 / cfg.stdp_tau).exp();
        assert!((net.weight(1, 2).unwrap() - potentiated).abs() < 1e-7);
        assert!((net.weight(3, 4).unwrap() - depressed).abs() < 1e-7);
        assert_eq!(net.weight(5, 6), Some(0.0));
    }

    #[test]
    fn test_prune_and_import() {
        let mut net = SpikingNetwork::new(&settings());
        let removed = net.prune_connections(0.1);
        assert!(removed > 0);
        assert!(net
            .export_connections()
            .iter()
            .all(|c| c.weight.abs() >= 0.1));

        net.import_connections(&[
            Connection { from: 1, to: 2, weight: 0.5 },
            Connection { from: 9999, to: 2, weight: 0.5 },
        ]);
        assert_eq!(net.stats().connections, 1);
        assert_eq!(net.weight(1, 2), Some(0.5));
    }
}
