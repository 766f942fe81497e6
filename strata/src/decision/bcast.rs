use crate::config::EngineConfig;
use crate::shm::LEADER_SHM_SIZE;

/// How a layer of the broadcast tree fans out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOut {
    /// Binomial tree over the layer's communicator.
    Binomial,
    /// The layer root sends to every member directly.
    Linear,
}

impl FanOut {
    pub fn from_linear(linear: bool) -> Self {
        if linear { FanOut::Linear } else { FanOut::Binomial }
    }
}

/// Subgroup count a table rule asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubgroupSpan {
    /// The configured subgroup size.
    Subgroup,
    /// The whole group: base distribution reaches every rank directly.
    Whole,
}

/// One row of a broadcast table: applies to payloads of at most
/// `max_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BcastRule {
    pub max_bytes: usize,
    pub span: SubgroupSpan,
    /// Fan-out of the leader, base and leaf layers.
    pub fan_out: [FanOut; 3],
    pub use_numa: bool,
    pub use_socket: bool,
    pub use_shm: bool,
}

impl BcastRule {
    const fn new(max_bytes: usize, span: SubgroupSpan, lin: [bool; 3]) -> Self {
        Self {
            max_bytes,
            span,
            fan_out: [
                if lin[0] { FanOut::Linear } else { FanOut::Binomial },
                if lin[1] { FanOut::Linear } else { FanOut::Binomial },
                if lin[2] { FanOut::Linear } else { FanOut::Binomial },
            ],
            use_numa: false,
            use_socket: false,
            use_shm: false,
        }
    }

    const fn numa(mut self) -> Self {
        self.use_numa = true;
        self
    }

    const fn socket(mut self) -> Self {
        self.use_socket = true;
        self
    }

    const fn shm(mut self) -> Self {
        self.use_shm = true;
        self
    }
}

/// Rules for groups up to `limit`, ordered by `max_bytes`; the last rule
/// catches every larger payload.
///
/// In the single-node table `limit` is a multiple of the subgroup size; in
/// the multi-node table it is a node count. `usize::MAX` closes a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BcastBand {
    pub limit: usize,
    pub rules: Vec<BcastRule>,
}

impl BcastBand {
    fn rule_for(&self, bytes: usize) -> Option<&BcastRule> {
        self.rules
            .iter()
            .find(|r| bytes <= r.max_bytes)
            .or_else(|| self.rules.last())
    }
}

/// Broadcast tuning data. [`Default`] reproduces the shipped tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BcastTable {
    /// Groups smaller than this use the linear fallback.
    pub linear_below: usize,
    /// With at least this many nodes, payloads up to
    /// `knomial_multi_node_max_bytes` use the k-nomial fallback.
    pub knomial_min_nodes: usize,
    pub knomial_multi_node_max_bytes: usize,
    /// On one node, groups of at least this size with payloads below
    /// `knomial_single_node_below_bytes` use the k-nomial fallback.
    pub knomial_single_node_min_size: usize,
    pub knomial_single_node_below_bytes: usize,
    pub knomial_radix: u32,
    /// Shared-memory broadcast bounds.
    pub shm_max_bytes: usize,
    pub shm_min_size: usize,
    pub single_node: Vec<BcastBand>,
    pub multi_node: Vec<BcastBand>,
}

impl Default for BcastTable {
    fn default() -> Self {
        use SubgroupSpan::{Subgroup as Sg, Whole};
        const F: bool = false;
        const T: bool = true;
        let r = BcastRule::new;
        let top = usize::MAX;

        let single_node = vec![
            BcastBand {
                limit: 1,
                rules: vec![r(8192, Sg, [F, F, F]), r(top, Sg, [F, T, T])],
            },
            BcastBand {
                limit: 2,
                rules: vec![
                    r(1024, Whole, [F, F, F]),
                    r(8192, Sg, [F, F, F]),
                    r(2_097_152, Whole, [F, T, T]),
                    r(top, Sg, [F, F, F]),
                ],
            },
            BcastBand {
                limit: 4,
                rules: vec![
                    r(1024, Whole, [F, F, F]),
                    r(8192, Sg, [F, F, F]),
                    r(32768, Sg, [F, T, T]),
                    r(4_194_304, Whole, [F, T, T]),
                    r(top, Sg, [F, F, F]),
                ],
            },
            BcastBand {
                limit: 8,
                rules: vec![
                    r(1024, Whole, [F, F, F]),
                    r(8192, Sg, [F, F, F]),
                    r(262_144, Sg, [F, T, T]),
                    r(top, Whole, [F, T, T]),
                ],
            },
            BcastBand {
                limit: 16,
                rules: vec![
                    r(512, Whole, [F, F, F]),
                    r(8192, Sg, [F, F, F]),
                    r(262_144, Sg, [F, T, T]),
                    r(top, Whole, [F, T, T]),
                ],
            },
            BcastBand {
                limit: top,
                rules: vec![
                    r(512, Whole, [F, F, F]),
                    r(8192, Sg, [F, F, F]),
                    r(262_144, Sg, [F, T, T]),
                    r(16_777_216, Whole, [F, T, T]),
                    r(top, Sg, [F, T, T]).numa(),
                ],
            },
        ];

        let multi_node = vec![
            BcastBand {
                limit: 2,
                rules: vec![
                    r(8192, Sg, [T, T, T]).shm(),
                    r(2_097_152, Sg, [T, T, T]).socket(),
                    r(top, Sg, [T, T, T]).socket().numa(),
                ],
            },
            BcastBand {
                limit: 4,
                rules: vec![
                    r(64, Sg, [T, T, F]).socket(),
                    r(512, Sg, [T, T, F]).shm(),
                    r(2_097_152, Sg, [T, T, T]).socket(),
                    r(4_194_304, Sg, [T, T, T]).numa(),
                    r(top, Sg, [T, T, T]).numa().socket(),
                ],
            },
            BcastBand {
                limit: 6,
                rules: vec![
                    r(4096, Sg, [T, T, T]).shm(),
                    r(524_288, Sg, [T, T, T]).socket(),
                    r(top, Sg, [T, T, T]).numa(),
                ],
            },
            BcastBand {
                limit: 8,
                rules: vec![
                    r(8192, Sg, [T, T, T]).shm(),
                    r(top, Sg, [T, T, T]).numa(),
                ],
            },
            BcastBand {
                limit: 10,
                rules: vec![
                    r(32768, Sg, [T, T, F]).numa(),
                    r(top, Sg, [T, T, T]).numa(),
                ],
            },
            BcastBand {
                limit: top,
                rules: vec![
                    r(64, Sg, [T, F, T]).numa(),
                    r(2_097_152, Sg, [T, T, T]).numa(),
                    r(top, Sg, [F, T, T]).numa().socket(),
                ],
            },
        ];

        Self {
            linear_below: 8,
            knomial_min_nodes: 8,
            knomial_multi_node_max_bytes: 65536,
            knomial_single_node_min_size: 256,
            knomial_single_node_below_bytes: 16384,
            knomial_radix: 4,
            shm_max_bytes: 8192,
            shm_min_size: 16,
            single_node,
            multi_node,
        }
    }
}

/// Shape of a broadcast call, identical on every rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BcastShape {
    /// Ranks in the communicator.
    pub size: usize,
    /// Payload bytes.
    pub bytes: usize,
    pub num_nodes: usize,
    /// Ranks on the most populated node.
    pub node_size: usize,
    /// Predefined datatype in host memory.
    pub shm_capable: bool,
}

/// Parameters of a hierarchical broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmChoice {
    /// Ranks per subgroup.
    pub sg_count: usize,
    /// Base distribution covers the whole node (or socket) in one stage.
    pub single_stage: bool,
    /// Run the top layer among node leaders.
    pub use_leaders: bool,
    pub top: FanOut,
    pub base: FanOut,
    pub leaf: FanOut,
    pub use_numa: bool,
    pub use_socket: bool,
    pub use_shm: bool,
}

/// Broadcast execution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcastAlgorithm {
    /// Flat fan-out from the root.
    Linear,
    /// K-nomial tree over the whole communicator.
    Knomial { radix: u32 },
    /// Multi-phase broadcast over the cached hierarchy.
    Hierarchical(AlgorithmChoice),
}

impl BcastTable {
    /// Choose the strategy for a broadcast on a communicator with a cached
    /// hierarchy. Pure; every rank gets the same answer.
    pub fn decide(&self, config: &EngineConfig, shape: &BcastShape) -> BcastAlgorithm {
        let BcastShape {
            size,
            bytes,
            num_nodes,
            node_size,
            shm_capable,
        } = *shape;

        if size < self.linear_below {
            return BcastAlgorithm::Linear;
        }
        if (num_nodes >= self.knomial_min_nodes && bytes <= self.knomial_multi_node_max_bytes)
            || (num_nodes == 1
                && size >= self.knomial_single_node_min_size
                && bytes < self.knomial_single_node_below_bytes)
        {
            return BcastAlgorithm::Knomial {
                radix: self.knomial_radix,
            };
        }

        let mut choice = self.table_choice(config, shape);

        choice.use_shm = choice.use_shm
            && bytes <= self.shm_limit()
            && size >= self.shm_min_size
            && shm_capable
            && !choice.use_socket;
        // Multi-node trees need the leader layer to bridge nodes.
        if num_nodes > 1 {
            choice.use_leaders = true;
        }
        choice.single_stage = choice.sg_count == node_size;
        BcastAlgorithm::Hierarchical(choice)
    }

    /// Largest payload the shared-memory path takes: the table bound,
    /// capped by the staging area of a node region.
    fn shm_limit(&self) -> usize {
        self.shm_max_bytes.min(LEADER_SHM_SIZE)
    }

    fn table_choice(&self, config: &EngineConfig, shape: &BcastShape) -> AlgorithmChoice {
        let sg = config.sg_count();
        let mut choice = AlgorithmChoice {
            sg_count: sg,
            single_stage: false,
            use_leaders: false,
            top: FanOut::Binomial,
            base: FanOut::Binomial,
            leaf: FanOut::Binomial,
            use_numa: false,
            use_socket: false,
            use_shm: false,
        };

        let single_node = shape.size <= shape.node_size;
        if single_node
            && shape.bytes <= self.shm_limit()
            && shape.size >= self.shm_min_size
            && !config.disable_shmbcast
        {
            // Overrides do not apply to the shared-memory fast path.
            choice.use_shm = true;
            return choice;
        }

        if config.use_dynamic_rules {
            choice.sg_count = if config.mnode_sg_size() == sg {
                sg
            } else {
                shape.node_size
            };
            choice.use_leaders = !single_node;
            choice.top = FanOut::from_linear(config.bcast_lin0);
            choice.base = FanOut::from_linear(config.bcast_lin1);
            choice.leaf = FanOut::from_linear(config.bcast_lin2);
        } else {
            let (bands, key) = if single_node {
                (&self.single_node, shape.size.div_ceil(sg.max(1)))
            } else {
                (&self.multi_node, shape.num_nodes)
            };
            let rule = bands
                .iter()
                .find(|b| key <= b.limit)
                .or_else(|| bands.last())
                .and_then(|b| b.rule_for(shape.bytes));
            if let Some(rule) = rule {
                choice.sg_count = match rule.span {
                    SubgroupSpan::Subgroup => sg,
                    SubgroupSpan::Whole => shape.size,
                };
                choice.use_leaders = !single_node;
                [choice.top, choice.base, choice.leaf] = rule.fan_out;
                choice.use_numa = rule.use_numa;
                choice.use_socket = rule.use_socket;
                choice.use_shm = rule.use_shm;
            }
        }

        if let Some(numa) = config.force_numa {
            choice.use_numa = numa;
            if numa {
                choice.sg_count = sg;
            }
        }
        if let Some(socket) = config.bcast_socket {
            choice.use_socket = socket;
        }
        if config.disable_shmbcast {
            choice.use_shm = false;
        }
        choice
    }
}
