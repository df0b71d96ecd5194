//! Meta-method names and metafield lookup.

use lunet_core::string::{Interner, StrId};

/// Pre-interned meta-method names.
pub struct MetaNames {
    pub add: StrId,
    pub sub: StrId,
    pub mul: StrId,
    pub mod_: StrId,
    pub pow: StrId,
    pub div: StrId,
    pub idiv: StrId,
    pub band: StrId,
    pub bor: StrId,
    pub bxor: StrId,
    pub shl: StrId,
    pub shr: StrId,
    pub unm: StrId,
    pub bnot: StrId,
    pub eq: StrId,
    pub lt: StrId,
    pub le: StrId,
    pub index: StrId,
    pub newindex: StrId,
    pub call: StrId,
    pub len: StrId,
    pub concat: StrId,
    pub tostring: StrId,
    pub pairs: StrId,
}

impl MetaNames {
    pub fn init(strings: &mut Interner) -> Self {
        MetaNames {
            add: strings.intern(b"__add"),
            sub: strings.intern(b"__sub"),
            mul: strings.intern(b"__mul"),
            mod_: strings.intern(b"__mod"),
            pow: strings.intern(b"__pow"),
            div: strings.intern(b"__div"),
            idiv: strings.intern(b"__idiv"),
            band: strings.intern(b"__band"),
            bor: strings.intern(b"__bor"),
            bxor: strings.intern(b"__bxor"),
            shl: strings.intern(b"__shl"),
            shr: strings.intern(b"__shr"),
            unm: strings.intern(b"__unm"),
            bnot: strings.intern(b"__bnot"),
            eq: strings.intern(b"__eq"),
            lt: strings.intern(b"__lt"),
            le: strings.intern(b"__le"),
            index: strings.intern(b"__index"),
            newindex: strings.intern(b"__newindex"),
            call: strings.intern(b"__call"),
            len: strings.intern(b"__len"),
            concat: strings.intern(b"__concat"),
            tostring: strings.intern(b"__tostring"),
            pairs: strings.intern(b"__pairs"),
        }
    }
}
