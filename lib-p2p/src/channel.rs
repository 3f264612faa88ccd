//! Operating channel selection
//!
//! Frequencies in use by other interfaces on the same radio constrain what a
//! new group may use: with `num_multichan_concurrent` channels available, a
//! group either shares one of the used frequencies or takes a free slot.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::P2pConfig;
use crate::error::ChannelError;

/// Center frequency of a channel in an operating class
pub fn channel_to_freq(reg_class: u8, channel: u8) -> Option<u32> {
    let ch = u32::from(channel);
    match reg_class {
        81 if (1..=13).contains(&channel) => Some(2407 + 5 * ch),
        82 if channel == 14 => Some(2484),
        115..=130 if channel >= 36 => Some(5000 + 5 * ch),
        180 if (1..=6).contains(&channel) => Some(56160 + 2160 * ch),
        _ => None,
    }
}

pub fn is_24ghz(freq: u32) -> bool {
    (2412..=2484).contains(&freq)
}

pub fn is_5ghz(freq: u32) -> bool {
    (4900..=5900).contains(&freq)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegClass {
    pub reg_class: u8,
    pub channels: Vec<u8>,
}

/// Set of channels usable for P2P, kept as frequencies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSet {
    freqs: BTreeSet<u32>,
}

impl ChannelSet {
    pub fn from_classes(classes: &[RegClass]) -> Self {
        let freqs = classes
            .iter()
            .flat_map(|c| c.channels.iter().filter_map(|ch| channel_to_freq(c.reg_class, *ch)))
            .collect();
        Self { freqs }
    }

    pub fn from_freqs(freqs: impl IntoIterator<Item = u32>) -> Self {
        Self {
            freqs: freqs.into_iter().collect(),
        }
    }

    /// Channel set of a dual-band device, with the 60 GHz class when supported
    pub fn default_for(support_60ghz: bool) -> Self {
        let mut classes = vec![
            RegClass {
                reg_class: 81,
                channels: (1..=11).collect(),
            },
            RegClass {
                reg_class: 115,
                channels: vec![36, 40, 44, 48],
            },
            RegClass {
                reg_class: 124,
                channels: vec![149, 153, 157, 161],
            },
        ];
        if support_60ghz {
            classes.push(RegClass {
                reg_class: 180,
                channels: vec![1, 2, 3, 4],
            });
        }
        Self::from_classes(&classes)
    }

    pub fn contains(&self, freq: u32) -> bool {
        self.freqs.contains(&freq)
    }

    pub fn is_empty(&self) -> bool {
        self.freqs.is_empty()
    }

    pub fn freqs(&self) -> impl Iterator<Item = u32> + '_ {
        self.freqs.iter().copied()
    }

    pub fn intersection(&self, other: &ChannelSet) -> ChannelSet {
        ChannelSet {
            freqs: self.freqs.intersection(&other.freqs).copied().collect(),
        }
    }
}

/// A frequency some interface on the radio operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsedFreq {
    pub freq: u32,
    pub infra_station: bool,
    pub p2p_client: bool,
    pub p2p_go: bool,
}

impl UsedFreq {
    pub fn station(freq: u32) -> Self {
        Self {
            freq,
            infra_station: true,
            ..Self::default()
        }
    }

    pub fn p2p_client(freq: u32) -> Self {
        Self {
            freq,
            p2p_client: true,
            ..Self::default()
        }
    }

    pub fn p2p_go(freq: u32) -> Self {
        Self {
            freq,
            p2p_go: true,
            ..Self::default()
        }
    }
}

/// Outcome of frequency setup before negotiation starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreqPlan {
    /// Frequency the negotiation must use
    pub force: Option<u32>,
    /// Frequency the negotiation should prefer
    pub pref: Option<u32>,
}

/// Frequencies measured as least loaded by the station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BestFreqs {
    pub overall: Option<u32>,
    pub freq_24: Option<u32>,
    pub freq_5: Option<u32>,
}

pub struct ChannelSelectionPolicy {
    supported: ChannelSet,
    disallowed: BTreeSet<u32>,
    num_mcc: usize,
    ignore_shared_freq: bool,
    oper_reg_class: u8,
    oper_channel: u8,
    best: BestFreqs,
    rng: StdRng,
}

impl std::fmt::Debug for ChannelSelectionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSelectionPolicy")
            .field("supported", &self.supported)
            .field("num_mcc", &self.num_mcc)
            .field("best", &self.best)
            .finish_non_exhaustive()
    }
}

impl ChannelSelectionPolicy {
    pub fn new(config: &P2pConfig, supported: ChannelSet) -> Self {
        debug!(
            num_mcc = config.num_multichan_concurrent,
            "Initializing channel selection policy"
        );
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            supported,
            disallowed: BTreeSet::new(),
            num_mcc: config.num_multichan_concurrent,
            ignore_shared_freq: config.ignore_shared_freq,
            oper_reg_class: config.oper_reg_class,
            oper_channel: config.oper_channel,
            best: BestFreqs::default(),
            rng,
        }
    }

    pub fn supported(&self) -> &ChannelSet {
        &self.supported
    }

    /// Replace the channel set after a country or driver capability change
    pub fn set_supported(&mut self, supported: ChannelSet) {
        self.supported = supported;
    }

    pub fn set_best_freqs(&mut self, best: BestFreqs) {
        self.best = best;
    }

    pub fn set_disallowed(&mut self, freqs: impl IntoIterator<Item = u32>) {
        self.disallowed = freqs.into_iter().collect();
    }

    pub fn is_supported(&self, freq: u32) -> bool {
        self.supported.contains(freq) && !self.disallowed.contains(&freq)
    }

    pub fn num_mcc(&self) -> usize {
        self.num_mcc
    }

    /// Concurrent channels the hardware has that no interface uses yet
    pub fn num_unused_channels(&self, used: &[UsedFreq]) -> i64 {
        let distinct: BTreeSet<u32> = used.iter().map(|u| u.freq).filter(|f| *f > 0).collect();
        let unused = self.num_mcc as i64 - distinct.len() as i64;
        debug!(unused, "num_unused_channels");
        unused
    }

    /// Used frequencies that are also valid for P2P, at most one per MCC slot
    pub fn valid_oper_freqs(&self, used: &[UsedFreq]) -> Vec<UsedFreq> {
        let mut out: Vec<UsedFreq> = Vec::new();
        for u in used.iter().filter(|u| self.is_supported(u.freq)) {
            if out.len() >= self.num_mcc {
                break;
            }
            match out.iter_mut().find(|o| o.freq == u.freq) {
                Some(existing) => {
                    existing.infra_station |= u.infra_station;
                    existing.p2p_client |= u.p2p_client;
                    existing.p2p_go |= u.p2p_go;
                }
                None => out.push(*u),
            }
        }
        out
    }

    /// Prefer a frequency used by an infrastructure station, then one used by
    /// a P2P client, else the first supported candidate
    pub fn pick_best_used_frequency(&self, freqs: &[UsedFreq]) -> Option<u32> {
        let supported = move || freqs.iter().filter(move |f| self.is_supported(f.freq));
        supported()
            .find(|f| f.infra_station)
            .or_else(|| supported().find(|f| f.p2p_client))
            .or_else(|| supported().next())
            .map(|f| f.freq)
    }

    /// Whether a group on `freq` would exceed the concurrency limit
    pub fn check_freq_conflict(&self, freq: u32, used: &[UsedFreq]) -> bool {
        if self.num_unused_channels(used) > 0 {
            return false;
        }
        let shared = self.valid_oper_freqs(used).iter().any(|u| u.freq == freq);
        if shared {
            debug!(freq, "Frequency in use by another interface and can be shared");
        }
        !shared
    }

    /// Decide forced/preferred frequency for a new negotiation.
    ///
    /// `freq` is the caller's requested frequency, 0 for none.
    pub fn setup_freqs(&self, freq: u32, used: &[UsedFreq], go: bool) -> Result<FreqPlan, ChannelError> {
        let valid = self.valid_oper_freqs(used);
        let num_unused = self.num_unused_channels(used);
        debug!(
            freq,
            go,
            num_mcc = self.num_mcc,
            shared_freqs = valid.len(),
            num_unused,
            "Setup freqs"
        );

        if freq > 0 {
            if !self.is_supported(freq) {
                debug!(freq, "Forced channel is not supported for P2P uses");
                return Err(ChannelError::Unsupported(freq));
            }
            let in_use = valid.iter().any(|u| u.freq == freq);
            if num_unused <= 0 && !in_use {
                debug!(freq, "Cannot start P2P group, no available channels");
                return Err(ChannelError::NoChannelAvailable);
            }
            return Ok(FreqPlan {
                force: Some(freq),
                pref: None,
            });
        }

        match self.pick_best_used_frequency(&valid) {
            Some(best) if num_unused > 0 => {
                debug!(best, "Prefer a frequency already in use");
                Ok(FreqPlan {
                    force: None,
                    pref: Some(best),
                })
            }
            Some(best) => {
                debug!(best, "Force a frequency already in use");
                Ok(FreqPlan {
                    force: Some(best),
                    pref: None,
                })
            }
            None if num_unused > 0 => Ok(FreqPlan::default()),
            None => {
                debug!("All channels are in use and none of them are P2P enabled");
                Err(ChannelError::NoChannelAvailable)
            }
        }
    }

    /// Resolve a band request (2 or 5) or validate an explicit GO frequency.
    /// Returns `None` when no frequency was requested.
    pub fn select_go_band(&mut self, freq: u32) -> Result<Option<u32>, ChannelError> {
        let freq = match freq {
            0 => return Ok(None),
            2 => match self.best.freq_24.filter(|f| self.is_supported(*f)) {
                Some(best) => best,
                None => 2412 + self.rng.gen_range(0..3u32) * 25,
            },
            5 => match self.best.freq_5.filter(|f| self.is_supported(*f)) {
                Some(best) => best,
                None => 5180 + self.rng.gen_range(0..4u32) * 20,
            },
            other => other,
        };
        if !self.is_supported(freq) {
            debug!(freq, "Forced GO channel is not supported for P2P uses");
            return Err(ChannelError::Unsupported(freq));
        }
        debug!(freq, "GO band request resolved");
        Ok(Some(freq))
    }

    fn shared_freq_suppressed(&self, used: &[UsedFreq]) -> bool {
        self.ignore_shared_freq && self.num_mcc > 1 && self.num_unused_channels(used) > 0
    }

    /// Pick the operating frequency for a GO.
    ///
    /// `allowed` is the channel intersection with the peer (or our own set for
    /// an autonomous GO).
    pub fn select_go_channel(
        &mut self,
        requested: u32,
        allowed: &ChannelSet,
        used: &[UsedFreq],
    ) -> Result<u32, ChannelError> {
        let usable = |policy: &Self, f: u32| allowed.contains(f) && policy.is_supported(f);

        let mut freq = if requested > 0 {
            if !allowed.contains(requested) {
                debug!(requested, "Forced GO freq not accepted");
                return Err(ChannelError::NotInIntersection(requested));
            }
            requested
        } else {
            self.preferred_go_freq(allowed)?
        };

        let valid = self.valid_oper_freqs(used);
        if requested == 0 {
            if self.shared_freq_suppressed(used) {
                debug!(freq, "Ignore own channel preference due to ignore_shared_freq");
            } else if let Some(cand) = self
                .pick_best_used_frequency(&valid)
                .filter(|f| usable(self, *f))
            {
                freq = cand;
            } else if let Some(u) = valid.iter().find(|u| allowed.contains(u.freq)) {
                debug!(freq = u.freq, "Force GO on a channel already in use");
                freq = u.freq;
            } else if self.num_unused_channels(used) <= 0 {
                debug!("Cannot force GO on any of the channels already in use");
                return Err(ChannelError::NoChannelAvailable);
            }
        } else if !valid.iter().any(|u| u.freq == requested) && self.num_unused_channels(used) <= 0 {
            debug!(requested, "Cannot force GO, all channels are in use");
            return Err(ChannelError::NoChannelAvailable);
        }

        debug!(freq, "Selected GO operating frequency");
        Ok(freq)
    }

    fn preferred_go_freq(&mut self, allowed: &ChannelSet) -> Result<u32, ChannelError> {
        let usable = |policy: &Self, f: u32| allowed.contains(f) && policy.is_supported(f);

        if self.oper_reg_class == 81 && (1..=11).contains(&self.oper_channel) {
            let f = 2407 + 5 * u32::from(self.oper_channel);
            if allowed.contains(f) {
                debug!(freq = f, "GO freq from configured channel");
                return Ok(f);
            }
        }
        if matches!(self.oper_reg_class, 115 | 116 | 117 | 124 | 126 | 127) {
            let f = 5000 + 5 * u32::from(self.oper_channel);
            if allowed.contains(f) {
                debug!(freq = f, "GO freq from configured channel");
                return Ok(f);
            }
        }
        if self.oper_channel == 0 {
            let best = [self.best.overall, self.best.freq_24, self.best.freq_5];
            if let Some(f) = best.into_iter().flatten().find(|f| usable(self, *f)) {
                debug!(freq = f, "GO freq from best channel");
                return Ok(f);
            }
        }
        self.select_freq_no_pref(allowed)
    }

    fn select_freq_no_pref(&mut self, allowed: &ChannelSet) -> Result<u32, ChannelError> {
        let usable = |policy: &Self, f: u32| allowed.contains(f) && policy.is_supported(f);
        let r: u32 = self.rng.gen_range(0..3);

        let social = (0..3).map(|i| 2412 + ((r + i) % 3) * 25);
        let class81 = (0..11).map(|i| 2412 + i * 5);
        let social60 = std::iter::once(58320 + 2160);
        let class180 = (0..4).map(|i| 58320 + i * 2160);

        let picked = social
            .chain(class81)
            .chain(social60)
            .chain(class180)
            .find(|f| usable(self, *f));
        match picked {
            Some(f) => {
                debug!(freq = f, "Set GO freq (no preference known)");
                Ok(f)
            }
            None => {
                debug!("No 2.4 and 60 GHz channel allowed");
                Err(ChannelError::NoChannelAvailable)
            }
        }
    }

    /// Channel outcome for an accepted invitation.
    ///
    /// Prefers a frequency we already use, forcing it when the hardware cannot
    /// run another channel. With spare MCC capacity a forced channel is dropped
    /// for a client, and for a GO when it lies outside the peer intersection,
    /// so the channel gets renegotiated.
    pub fn resolve_invitation_conflict(
        &self,
        go: bool,
        force_freq: Option<u32>,
        peer_channels: &ChannelSet,
        used: &[UsedFreq],
    ) -> FreqPlan {
        let mut plan = FreqPlan {
            force: force_freq.filter(|f| *f > 0),
            pref: None,
        };
        let valid = self.valid_oper_freqs(used);
        let spare = self.num_unused_channels(used) > 0;

        if let Some(best) = self.pick_best_used_frequency(&valid) {
            if !self.shared_freq_suppressed(used) {
                debug!(best, "Prefer a channel already used by one of the interfaces");
                plan.pref = Some(best);
            }
            if self.num_mcc < 2 || !spare {
                debug!(best, "No extra channels available, force a channel already in use");
                plan.force = Some(best);
            }
        }

        if let Some(force) = plan.force {
            if self.num_mcc > 1 && spare {
                if !go {
                    debug!("Peer is running a GO and we are capable of MCC");
                    plan.force = None;
                } else if !peer_channels.contains(force) {
                    debug!(force, "Forced GO freq not in intersection but we are capable of MCC");
                    plan.force = None;
                }
            }
        }
        plan
    }
}
