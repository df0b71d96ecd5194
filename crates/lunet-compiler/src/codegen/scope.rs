/// Scope, register, and jump-list bookkeeping for one function being
/// compiled.
use lunet_core::string::StrId;

/// An active local variable.
#[derive(Clone, Debug)]
pub struct LocalSlot {
    pub name: StrId,
    pub reg: u8,
    /// Index of this local's debug record in the prototype.
    pub debug_idx: usize,
}

/// A forward goto waiting for its label.
#[derive(Clone, Debug)]
pub struct PendingGoto {
    pub name: StrId,
    pub pc: usize,
    pub line: u32,
    pub num_locals: usize,
}

/// A label visible in some enclosing block.
#[derive(Clone, Debug)]
pub struct LabelInfo {
    pub name: StrId,
    pub pc: usize,
    pub num_locals: usize,
    /// Register watermark at the label, for close hints.
    pub free_reg: u8,
}

/// Per-block bookkeeping: break/continue patch lists, labels, pending
/// gotos, and the register watermark to restore on exit.
#[derive(Clone, Debug)]
pub struct BlockScope {
    pub locals_on_entry: usize,
    pub free_reg_on_entry: u8,
    pub is_loop: bool,
    pub breaks: Vec<usize>,
    pub continues: Vec<usize>,
    pub pending_gotos: Vec<PendingGoto>,
    pub labels: Vec<LabelInfo>,
}

/// Registers and blocks of one function.
pub struct ScopeManager {
    pub locals: Vec<LocalSlot>,
    pub blocks: Vec<BlockScope>,
    /// Next free register (bump allocated).
    pub free_reg: u8,
    /// High-water mark of register usage.
    pub max_reg: u8,
    /// Registers captured as upvalues, for close hints on jumps.
    pub captured_regs: Vec<u8>,
}

impl ScopeManager {
    pub fn new() -> Self {
        ScopeManager {
            locals: Vec::new(),
            blocks: Vec::new(),
            free_reg: 0,
            max_reg: 0,
            captured_regs: Vec::new(),
        }
    }

    pub fn enter_block(&mut self, is_loop: bool) {
        self.blocks.push(BlockScope {
            locals_on_entry: self.locals.len(),
            free_reg_on_entry: self.free_reg,
            is_loop,
            breaks: Vec::new(),
            continues: Vec::new(),
            pending_gotos: Vec::new(),
            labels: Vec::new(),
        });
    }

    /// Pop the innermost block, dropping its locals and releasing their
    /// registers. Returns the block plus the locals that went dead.
    pub fn leave_block(&mut self) -> (BlockScope, Vec<LocalSlot>) {
        let block = self.blocks.pop().expect("unbalanced block");
        let dead = self.locals.split_off(block.locals_on_entry);
        self.free_reg = block.free_reg_on_entry;
        (block, dead)
    }

    /// Claim the next register for a named local.
    pub fn add_local(&mut self, name: StrId, debug_idx: usize) -> u8 {
        let reg = self.alloc_reg();
        self.locals.push(LocalSlot {
            name,
            reg,
            debug_idx,
        });
        reg
    }

    /// Claim a temporary register above the watermark.
    pub fn alloc_reg(&mut self) -> u8 {
        let reg = self.free_reg;
        self.free_reg += 1;
        if self.free_reg > self.max_reg {
            self.max_reg = self.free_reg;
        }
        reg
    }

    /// Claim `n` consecutive registers, returning the first.
    pub fn alloc_regs(&mut self, n: u8) -> u8 {
        let first = self.free_reg;
        self.free_reg += n;
        if self.free_reg > self.max_reg {
            self.max_reg = self.free_reg;
        }
        first
    }

    /// Release temporaries down to `level`.
    pub fn free_to(&mut self, level: u8) {
        debug_assert!(level <= self.free_reg);
        self.free_reg = level;
    }

    /// Raise the watermark to `level` (for slots filled by a multi-value
    /// instruction rather than one alloc_reg call each).
    pub fn reserve_to(&mut self, level: u8) {
        if level > self.free_reg {
            self.free_reg = level;
        }
        if self.free_reg > self.max_reg {
            self.max_reg = self.free_reg;
        }
    }

    /// Innermost local with this name, if any.
    pub fn resolve_local(&self, name: StrId) -> Option<&LocalSlot> {
        self.locals.iter().rev().find(|l| l.name == name)
    }

    /// Record that `reg` is captured by a closure.
    pub fn mark_captured(&mut self, reg: u8) {
        self.captured_regs.push(reg);
    }

    /// Whether any register at or above `level` has ever been captured.
    /// Used to decide whether a scope exit needs a close hint; a spurious
    /// hint is a runtime no-op, so over-approximation is fine.
    pub fn captured_at_or_above(&self, level: u8) -> bool {
        self.captured_regs.iter().any(|&r| r >= level)
    }

    pub fn innermost_loop(&mut self) -> Option<&mut BlockScope> {
        self.blocks.iter_mut().rev().find(|b| b.is_loop)
    }

    pub fn current_block_mut(&mut self) -> &mut BlockScope {
        self.blocks.last_mut().expect("no open block")
    }

    /// Search all enclosing blocks for a visible label.
    pub fn find_label(&self, name: StrId) -> Option<&LabelInfo> {
        self.blocks
            .iter()
            .rev()
            .flat_map(|b| b.labels.iter())
            .find(|l| l.name == name)
    }

    pub fn num_locals(&self) -> usize {
        self.locals.len()
    }
}

impl Default for ScopeManager {
    fn default() -> Self {
        Self::new()
    }
}
