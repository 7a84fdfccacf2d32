//! Reply-tree reconstruction.
//!
//! Every non-root note has a tree edge naming its thread root and, optionally,
//! the note it replies to. Descendants of a page of roots are loaded with one
//! query in row-id order and attached into a flat arena per thread. A reply is
//! attached under the first node, in depth-first order, whose id matches its
//! reply target. Replies whose parent is unknown, or would sit deeper than
//! [`MAX_THREAD_DEPTH`], are dropped.

use std::collections::HashMap;

use rusqlite::params_from_iter;

use crate::{Error, Result};
use crate::store::{NOTE_VIEW_COLUMNS, NoteView, Store, note_view_from_row, note_view_sql};

/// Deepest level a note can occupy; the root is level 1.
pub const MAX_THREAD_DEPTH: u8 = 8;

/// A descendant loaded from the tree table.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRow {
    pub view: NoteView,
    pub root_event_id: String,
    /// Empty when the note replies directly to the root.
    pub reply_event_id: String,
}

#[derive(Debug)]
struct ArenaNode {
    view: NoteView,
    /// Arena index of the parent; 0 is the root.
    parent: usize,
    children: Vec<usize>,
}

/// One thread, stored flat.
///
/// Index 0 is the root; index `i > 0` is `nodes[i - 1]`. A node is always
/// pushed after its parent, so parents have smaller indexes.
#[derive(Debug)]
pub struct ThreadArena {
    root: NoteView,
    root_children: Vec<usize>,
    nodes: Vec<ArenaNode>,
}

impl ThreadArena {
    pub fn new(mut root: NoteView) -> Self {
        root.depth = 1;
        root.children.clear();
        Self {
            root,
            root_children: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root.note.event_id
    }

    /// Number of notes in the thread, root included.
    pub fn len(&self) -> usize {
        self.nodes.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    fn view(&self, index: usize) -> &NoteView {
        match index {
            0 => &self.root,
            i => &self.nodes[i - 1].view,
        }
    }

    fn children(&self, index: usize) -> &[usize] {
        match index {
            0 => &self.root_children,
            i => &self.nodes[i - 1].children,
        }
    }

    /// Attach `child` under `reply_target`, or under the root when the
    /// target is empty. Returns false if the child was dropped.
    pub fn attach(&mut self, mut child: NoteView, reply_target: &str) -> bool {
        let parent = if reply_target.is_empty() {
            Some(0)
        } else {
            self.find(reply_target)
        };

        let Some(parent) = parent else {
            return false;
        };
        let depth = self.view(parent).depth + 1;
        if depth > MAX_THREAD_DEPTH {
            return false;
        }

        child.depth = depth;
        child.children.clear();
        self.nodes.push(ArenaNode {
            view: child,
            parent,
            children: Vec::new(),
        });
        let index = self.nodes.len();
        match parent {
            0 => self.root_children.push(index),
            p => self.nodes[p - 1].children.push(index),
        }
        true
    }

    /// Depth-first search for a node that can still take a child.
    fn find(&self, event_id: &str) -> Option<usize> {
        let mut stack = vec![0usize];

        while let Some(index) = stack.pop() {
            let view = self.view(index);
            if view.depth >= MAX_THREAD_DEPTH {
                continue;
            }
            if view.note.event_id == event_id {
                return Some(index);
            }
            // Reversed so the first child is visited first.
            stack.extend(self.children(index).iter().rev().copied());
        }
        None
    }

    /// Fold the arena into a nested tree.
    pub fn into_tree(self) -> NoteView {
        let mut root = self.root;
        let mut pending: Vec<Vec<NoteView>> = vec![Vec::new(); self.nodes.len() + 1];

        // Walking backwards completes each subtree before it is moved.
        for (offset, node) in self.nodes.into_iter().enumerate().rev() {
            let mut view = node.view;
            view.children = std::mem::take(&mut pending[offset + 1]);
            view.children.reverse();
            pending[node.parent].push(view);
        }

        root.children = std::mem::take(&mut pending[0]);
        root.children.reverse();
        root
    }
}

/// Loads descendants and assembles threads.
pub struct ThreadAssembler<'a> {
    store: &'a Store,
}

impl<'a> ThreadAssembler<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Load every visible descendant of the given roots in row-id order.
    ///
    /// Blocked authors, garbage and non-text kinds are excluded.
    pub fn load_children(&self, root_ids: &[String]) -> Result<Vec<ChildRow>> {
        if root_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; root_ids.len()].join(", ");
        let sql = note_view_sql(
            "t.root_event_id, t.reply_event_id",
            &format!(
                "JOIN trees t ON t.event_id = n.event_id
                 WHERE t.root_event_id IN ({})
                   AND n.kind = 1
                   AND n.garbage = 0
                   AND b.pubkey IS NULL
                 ORDER BY n.id ASC",
                placeholders
            ),
        );

        let conn = self.store.conn();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::Database(format!("Failed to prepare children: {}", e)))?;
        let rows = stmt
            .query_map(params_from_iter(root_ids.iter()), |row| {
                Ok(ChildRow {
                    view: note_view_from_row(row)?,
                    root_event_id: row.get(NOTE_VIEW_COLUMNS)?,
                    reply_event_id: row
                        .get::<_, Option<String>>(NOTE_VIEW_COLUMNS + 1)?
                        .unwrap_or_default(),
                })
            })
            .map_err(|e| Error::Database(format!("Failed to load children: {}", e)))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(format!("Failed to read children: {}", e)))
    }

    /// Attach the stored descendants of each root. Output order matches input.
    pub fn assemble(&self, roots: Vec<NoteView>) -> Result<Vec<NoteView>> {
        let root_ids: Vec<String> = roots.iter().map(|r| r.note.event_id.clone()).collect();
        let children = self.load_children(&root_ids)?;

        let mut arenas: Vec<ThreadArena> = roots.into_iter().map(ThreadArena::new).collect();
        let index: HashMap<String, usize> = arenas
            .iter()
            .enumerate()
            .map(|(i, arena)| (arena.root_id().to_string(), i))
            .collect();

        let mut dropped = 0usize;
        for child in children {
            let Some(&i) = index.get(&child.root_event_id) else {
                continue;
            };
            if !arenas[i].attach(child.view, &child.reply_event_id) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::debug!("Dropped {} replies with no reachable parent", dropped);
        }

        Ok(arenas.into_iter().map(ThreadArena::into_tree).collect())
    }
}
