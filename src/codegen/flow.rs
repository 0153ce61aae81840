use crate::ir::{BlockId, Function, ValueId};

use super::graph::{Graph, ID};

/// Def/use summary of one instruction or terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: usize, // position in the block, for debug
    pub defs: Vec<ValueId>,
    pub uses: Vec<ValueId>,
    pub is_move: bool,
}

impl Node {
    pub fn defs(&self) -> &[ValueId] {
        &self.defs
    }

    pub fn uses(&self) -> &[ValueId] {
        &self.uses
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Phi destinations, defined on block entry.
    pub phi_defs: Vec<ValueId>,
    /// Instructions followed by the terminator.
    pub nodes: Vec<Node>,
    /// Phi sources this block feeds into its successors. They are read on
    /// the way out of the block.
    pub exit_uses: Vec<ValueId>,
}

/// Control-flow graph of a function with one node per basic block.
pub struct FlowGraph {
    graph: Graph<Block>,
    ids: Vec<ID>,
    labels: Vec<BlockId>, // indexed by `ID`
    params: Vec<ValueId>,
}

impl FlowGraph {
    pub fn convert(func: &Function) -> Self {
        let mut graph = Graph::with_capacity(func.blocks().len());
        let mut ids = Vec::with_capacity(func.blocks().len());
        let mut labels = Vec::with_capacity(func.blocks().len());

        for block in func.blocks() {
            let mut nodes: Vec<Node> = block
                .instructions()
                .iter()
                .enumerate()
                .map(|(id, instruction)| Node {
                    id,
                    defs: instruction.def().into_iter().collect(),
                    uses: instruction.uses(),
                    is_move: instruction.is_move(),
                })
                .collect();
            nodes.push(Node {
                id: nodes.len(),
                defs: vec![],
                uses: block.terminator().uses(),
                is_move: false,
            });

            let exit_uses = block
                .succs()
                .iter()
                .flat_map(|succ| func.block(*succ).phis())
                .filter_map(|phi| phi.source_for(block.id()).and_then(|v| v.id()))
                .collect();

            let id = graph.insert(Block {
                phi_defs: block.phis().iter().filter_map(|phi| phi.dst.id()).collect(),
                nodes,
                exit_uses,
            });
            debug_assert_eq!(id.index(), labels.len());
            ids.push(id);
            labels.push(block.id());
        }

        for block in func.blocks() {
            for succ in block.succs() {
                graph.link(ids[block.id().index()], ids[succ.index()]);
            }
        }

        FlowGraph {
            graph,
            ids,
            labels,
            params: func.params().iter().filter_map(|p| p.id()).collect(),
        }
    }

    pub fn id(&self, block: BlockId) -> ID {
        self.ids[block.index()]
    }

    pub fn block(&self, block: BlockId) -> &Block {
        self.graph.get(self.id(block)).val()
    }

    pub fn blocks(&self) -> impl DoubleEndedIterator<Item = (BlockId, &Block)> + '_ {
        self.ids
            .iter()
            .map(|id| (self.labels[id.index()], self.graph.get(*id).val()))
    }

    pub fn succs(&self, block: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.graph
            .succ(self.id(block))
            .map(|id| self.labels[id.index()])
    }

    pub fn params(&self) -> &[ValueId] {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::{BinOp, FunctionBuilder, Type, Value};

    use super::*;

    #[test]
    fn test_convert() {
        // entry: i0 <- 0
        //        goto loop
        // loop:  i  <- phi(entry: i0, loop: i1)
        //        i1 <- i + 1
        //        c  <- i1 < n
        //        if c goto loop else exit
        // exit:  return i1
        let mut builder = FunctionBuilder::new("count", Some(Type::Int));
        let n = builder.param(Type::Int);
        let entry = builder.block("entry");
        let body = builder.block("loop");
        let exit = builder.block("exit");
        let i0 = builder.load(entry, Value::int(0));
        builder.branch(entry, body);
        let i = builder.phi(body, Type::Int, vec![(entry, i0)]);
        let i1 = builder.binop(body, BinOp::Add, i, Value::int(1));
        builder.add_phi_source(body, i, body, i1);
        let c = builder.binop(body, BinOp::Lt, i1, n);
        builder.cond_branch(body, c, body, exit);
        builder.ret(exit, Some(i1));
        let func = builder.build().unwrap();

        let flow = FlowGraph::convert(&func);
        let id = |v: Value| v.id().unwrap();

        struct Assert {
            block: Block,
            succ: Vec<BlockId>,
        }

        let expected = vec![
            Assert {
                block: Block {
                    phi_defs: vec![],
                    nodes: vec![
                        Node {
                            id: 0,
                            defs: vec![id(i0)],
                            uses: vec![],
                            is_move: false,
                        },
                        Node {
                            id: 1,
                            defs: vec![],
                            uses: vec![],
                            is_move: false,
                        },
                    ],
                    exit_uses: vec![id(i0)],
                },
                succ: vec![body],
            },
            Assert {
                block: Block {
                    phi_defs: vec![id(i)],
                    nodes: vec![
                        Node {
                            id: 0,
                            defs: vec![id(i1)],
                            uses: vec![id(i)],
                            is_move: false,
                        },
                        Node {
                            id: 1,
                            defs: vec![id(c)],
                            uses: vec![id(i1), id(n)],
                            is_move: false,
                        },
                        Node {
                            id: 2,
                            defs: vec![],
                            uses: vec![id(c)],
                            is_move: false,
                        },
                    ],
                    exit_uses: vec![id(i1)],
                },
                succ: vec![body, exit],
            },
            Assert {
                block: Block {
                    phi_defs: vec![],
                    nodes: vec![Node {
                        id: 0,
                        defs: vec![],
                        uses: vec![id(i1)],
                        is_move: false,
                    }],
                    exit_uses: vec![],
                },
                succ: vec![],
            },
        ];

        assert_eq!(flow.len(), expected.len());
        for ((block_id, block), assert) in flow.blocks().zip(expected) {
            assert_eq!(block, &assert.block);
            assert_eq!(flow.succs(block_id).collect::<Vec<_>>(), assert.succ);
        }
        assert_eq!(flow.params(), &[id(n)]);
    }
}
