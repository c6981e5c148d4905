//! Tokenizing parser for taproot wallet-policy descriptor templates.
//!
//! Grammar: `tr(KEYPATH[,TREE])` where KEYPATH is `@i/**` or
//! `musig(@i,@j,…)/**` (the `/<n;m>/*` receive/change form is accepted
//! everywhere `/**` is), and TREE is either a leaf script or a
//! `{left,right}` pair of subtrees. Leaf scripts support `pk(KEY)`.
//!
//! The template is parsed once into an AST; substitution and rendering
//! are separate passes over that AST, so a short key token can never be
//! confused with the prefix of a longer one.

use crate::error::{Error, Result};
use crate::taproot::TAPROOT_LEAF_TAPSCRIPT;

/// Maximum nesting depth of a script-tree template; deeper input is
/// rejected rather than recursed into.
pub const MAX_TREE_DEPTH: usize = 16;

/// One key slot in a template: a single key-info index or a musig
/// aggregation group, each with its receive/change derivation steps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyPlaceholder {
    Plain {
        key_index: u32,
        num1: u32,
        num2: u32,
    },
    Musig {
        key_indices: Vec<u32>,
        num1: u32,
        num2: u32,
    },
}

impl KeyPlaceholder {
    pub fn is_musig(&self) -> bool {
        matches!(self, KeyPlaceholder::Musig { .. })
    }

    /// The first derivation step for the receive or change branch.
    pub fn change_step(&self, is_change: bool) -> u32 {
        let (num1, num2) = match self {
            KeyPlaceholder::Plain { num1, num2, .. } => (*num1, *num2),
            KeyPlaceholder::Musig { num1, num2, .. } => (*num1, *num2),
        };
        if is_change { num2 } else { num1 }
    }

    /// Every key-info index this placeholder references.
    pub fn key_indices(&self) -> Vec<u32> {
        match self {
            KeyPlaceholder::Plain { key_index, .. } => vec![*key_index],
            KeyPlaceholder::Musig { key_indices, .. } => key_indices.clone(),
        }
    }
}

/// A leaf script with placeholders still unresolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptFragment {
    /// `pk(KEY)`: push the derived x-only key, then OP_CHECKSIG.
    Pk(KeyPlaceholder),
}

impl ScriptFragment {
    pub fn placeholder(&self) -> &KeyPlaceholder {
        match self {
            ScriptFragment::Pk(ph) => ph,
        }
    }
}

/// A parsed script-tree template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TapTreeTemplate {
    Leaf { version: u8, fragment: ScriptFragment },
    Branch(Box<TapTreeTemplate>, Box<TapTreeTemplate>),
}

/// A parsed `tr(…)` template: the keypath placeholder and the optional
/// script tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrDescriptorTemplate {
    pub key: KeyPlaceholder,
    pub tree: Option<TapTreeTemplate>,
}

impl TrDescriptorTemplate {
    pub fn parse(input: &str) -> Result<Self> {
        let mut parser = Parser { input, pos: 0 };
        parser.eat("tr(")?;
        let key = parser.parse_placeholder()?;
        let tree = if parser.try_eat(",") {
            Some(parser.parse_tree(0)?)
        } else {
            None
        };
        parser.eat(")")?;
        if parser.pos != input.len() {
            return Err(parser.error("trailing characters after template"));
        }
        Ok(TrDescriptorTemplate { key, tree })
    }

    /// The keypath placeholder first, then every leaf placeholder in
    /// left-to-right template order, paired with its leaf fragment.
    pub fn placeholders(&self) -> Vec<(&KeyPlaceholder, Option<&ScriptFragment>)> {
        let mut out = vec![(&self.key, None)];
        fn walk<'a>(
            tree: &'a TapTreeTemplate,
            out: &mut Vec<(&'a KeyPlaceholder, Option<&'a ScriptFragment>)>,
        ) {
            match tree {
                TapTreeTemplate::Leaf { fragment, .. } => {
                    out.push((fragment.placeholder(), Some(fragment)));
                }
                TapTreeTemplate::Branch(left, right) => {
                    walk(left, out);
                    walk(right, out);
                }
            }
        }
        if let Some(tree) = &self.tree {
            walk(tree, &mut out);
        }
        out
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, msg: &str) -> Error {
        Error::MalformedDescriptor(format!("{msg} at offset {}", self.pos))
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn eat(&mut self, token: &str) -> Result<()> {
        if self.try_eat(token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{token}'")))
        }
    }

    fn try_eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn parse_number(&mut self) -> Result<u32> {
        let digits: &str = self
            .rest()
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .unwrap_or("");
        if digits.is_empty() {
            return Err(self.error("expected a number"));
        }
        let value: u32 = digits
            .parse()
            .map_err(|_| self.error("number out of range"))?;
        self.pos += digits.len();
        Ok(value)
    }

    fn parse_key_index(&mut self) -> Result<u32> {
        self.eat("@")?;
        self.parse_number()
    }

    /// `/**` or `/<n;m>/*`.
    fn parse_derivation(&mut self) -> Result<(u32, u32)> {
        if self.try_eat("/**") {
            return Ok((0, 1));
        }
        if self.try_eat("/<") {
            let num1 = self.parse_number()?;
            self.eat(";")?;
            let num2 = self.parse_number()?;
            self.eat(">/*")?;
            return Ok((num1, num2));
        }
        Err(self.error("placeholder is missing its wildcard derivation"))
    }

    fn parse_placeholder(&mut self) -> Result<KeyPlaceholder> {
        if self.try_eat("musig(") {
            let mut key_indices = vec![self.parse_key_index()?];
            while self.try_eat(",") {
                key_indices.push(self.parse_key_index()?);
            }
            self.eat(")")?;
            let (num1, num2) = self.parse_derivation()?;
            Ok(KeyPlaceholder::Musig {
                key_indices,
                num1,
                num2,
            })
        } else if self.rest().starts_with('@') {
            let key_index = self.parse_key_index()?;
            let (num1, num2) = self.parse_derivation()?;
            Ok(KeyPlaceholder::Plain {
                key_index,
                num1,
                num2,
            })
        } else {
            Err(self.error("expected '@i' or 'musig(…)'"))
        }
    }

    fn parse_tree(&mut self, depth: usize) -> Result<TapTreeTemplate> {
        if depth > MAX_TREE_DEPTH {
            return Err(self.error("script tree nested too deeply"));
        }
        if self.try_eat("{") {
            let left = self.parse_tree(depth + 1)?;
            self.eat(",")?;
            let right = self.parse_tree(depth + 1)?;
            self.eat("}")?;
            return Ok(TapTreeTemplate::Branch(Box::new(left), Box::new(right)));
        }
        if self.try_eat("pk(") {
            let placeholder = self.parse_placeholder()?;
            self.eat(")")?;
            return Ok(TapTreeTemplate::Leaf {
                version: TAPROOT_LEAF_TAPSCRIPT,
                fragment: ScriptFragment::Pk(placeholder),
            });
        }
        Err(self.error("expected '{' or a leaf script fragment"))
    }
}
