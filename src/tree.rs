use hashbrown::HashMap;

use crate::errors::{ HubitError, Result };
use crate::path::{ self, ModelIndex, ModelPath, QueryIndex, QueryPath };
use crate::utils::split_items;
use crate::value::{ Nested, Value };

use Children::*;
use LengthTree::*;

/// Stores length information for multi-dimensional and non-rectangular
/// data. One level per index identifier in a given context; a node at
/// level k holds one child per entry of the corresponding list in the
/// input. The deepest level's children are sentinel leaves carrying only
/// their sibling index. Trees are built once per model+input and cached
/// per index context; pruning and clipping for a query happen on clones.
///
/// Nodes live in an arena indexed by `NodeId` rather than holding
/// parent/child references, so a deep copy is a plain `clone()` and
/// removal is marking the slot vacant.
#[derive(Debug, Clone)]
pub enum LengthTree {
    /// Stand-in for paths without index identifiers (or with all
    /// positions fixed to digits) : every operation is the identity.
    Dummy,
    Shaped(ShapedTree),
}

pub type NodeId = usize;

#[derive(Debug, Clone)]
struct LengthNode {
    parent : Option<NodeId>,
    level : usize,
    /// Sibling index in the parent's child list. Stable under pruning,
    /// which is what lets expanded paths keep their original positions.
    index : usize,
    /// Set when pruning fixed this level to a single child; a level
    /// where every node is constrained collapses in the response shape.
    constrained : bool,
    children : Children,
}

#[derive(Debug, Clone)]
enum Children {
    /// Bottom level; the values are the surviving sibling indices.
    Leaves(Vec<usize>),
    Nodes(Vec<NodeId>),
}

impl Children {
    fn len(&self) -> usize {
        match self {
            Leaves(idxs) => idxs.len(),
            Nodes(ids) => ids.len()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShapedTree {
    level_names : Vec<String>,
    arena : Vec<Option<LengthNode>>,
    levels : Vec<Vec<NodeId>>,
}

/// What expansion does at one level.
enum Step {
    Fixed(usize),
    ExpandAll,
}

impl LengthTree {
    /// Infer the tree for `path` by walking the input : at each index
    /// identifier, record the length of the list the path names at that
    /// position. A path with no identifiers (or all positions fixed)
    /// yields the dummy tree.
    pub fn from_path(path : &ModelPath, input : &Value) -> Result<LengthTree> {
        let indices = path.indices()?;
        if indices.is_empty() {
            return Ok(Dummy)
        }
        if indices.iter().all(|idx| match idx { ModelIndex::Digit(_) => true, _ => false }) {
            return Ok(Dummy)
        }
        if indices.iter().any(|idx| match idx { ModelIndex::Digit(_) => true, _ => false }) {
            return Err(HubitError::malformed(
                path.as_str(),
                "digits mixed with index identifiers in a shape-defining path",
            ))
        }

        let level_names = path.index_identifiers()?;
        let chunks = path.paths_between_identifiers()?;
        // The last element is the leaf attribute; lengths stop above it.
        let connecting = &chunks[..chunks.len() - 1];

        let mut tree = ShapedTree {
            level_names,
            arena : Vec::new(),
            levels : vec![Vec::new(); connecting.len()],
        };
        tree.build_node(input, connecting, 0, chunks[0].clone(), None, 0, path)?;
        Ok(Shaped(tree))
    }

    pub fn is_dummy(&self) -> bool {
        match self {
            Dummy => true,
            Shaped(_) => false
        }
    }

    pub fn idx_context(&self) -> String {
        match self {
            Dummy => String::new(),
            Shaped(tree) => tree.level_names.join("-")
        }
    }

    pub fn level_names(&self) -> &[String] {
        match self {
            Dummy => &[],
            Shaped(tree) => &tree.level_names
        }
    }

    /// Prune based on a query path where zero to all indices are
    /// already digits. Call `normalize` first; negative digits are
    /// rejected here.
    pub fn prune_from_query(&mut self, qpath : &QueryPath) -> Result<()> {
        let tree = match self {
            Dummy => return Ok(()),
            Shaped(tree) => tree
        };
        let indices = qpath.indices()?;
        if indices.len() != tree.levels.len() {
            return Err(HubitError::malformed(
                qpath.as_str(),
                format!("path does not match tree with levels {:?}", tree.level_names),
            ))
        }
        for (level, idx) in indices.iter().enumerate() {
            match idx {
                QueryIndex::Wildcard => (),
                QueryIndex::QDigit(d) if *d < 0 => {
                    return Err(HubitError::malformed(qpath.as_str(), "negative index must be normalized before pruning"))
                },
                QueryIndex::QDigit(d) => tree.fix_at(*d as usize, level)?,
            }
        }
        Ok(())
    }

    /// Prune by a partially index-resolved model path : digits fix
    /// their level, identifiers and wildcards leave it untouched.
    pub fn prune_from_model(&mut self, mpath : &ModelPath) -> Result<()> {
        let tree = match self {
            Dummy => return Ok(()),
            Shaped(tree) => tree
        };
        let indices = mpath.indices()?;
        if indices.len() != tree.levels.len() {
            return Err(HubitError::malformed(
                mpath.as_str(),
                format!("path does not match tree with levels {:?}", tree.level_names),
            ))
        }
        for (level, idx) in indices.iter().enumerate() {
            if let Some(d) = idx.fixed_digit() {
                tree.fix_at(d, level)?;
            }
        }
        Ok(())
    }

    /// Remove all levels below `level_name`.
    pub fn clip_at(&mut self, level_name : &str) -> Result<()> {
        match self {
            Dummy => Ok(()),
            Shaped(tree) => tree.clip_at(level_name)
        }
    }

    pub fn clipped_at(&self, level_name : &str) -> Result<LengthTree> {
        let mut clone = self.clone();
        clone.clip_at(level_name)?;
        Ok(clone)
    }

    /// Replace any negative digit with `len + digit`, where `len` is
    /// the child count of the node addressed by the digits preceding
    /// it.
    pub fn normalize(&self, qpath : &QueryPath) -> Result<QueryPath> {
        let tree = match self {
            Dummy => return Ok(qpath.clone()),
            Shaped(tree) => tree
        };
        tree.normalize(qpath)
    }

    /// Expand a path with wildcards or identifiers into the concrete
    /// paths consistent with the (typically pruned) tree, arranged in
    /// the shape the tree defines.
    pub fn expand_query_path(&self, qpath : &QueryPath) -> Result<Nested<QueryPath>> {
        match self {
            Dummy => Ok(Nested::One(qpath.clone())),
            Shaped(tree) => tree.reshape(self.expand_query_path_flat(qpath)?)
        }
    }

    /// Same, for a model path whose identifiers are to be iterated.
    pub fn expand_model_path(&self, mpath : &ModelPath) -> Result<Nested<QueryPath>> {
        match self {
            Dummy => Ok(Nested::One(mpath.to_query_path())),
            Shaped(tree) => {
                let (chunks, _) = path::parts(mpath.as_str())?;
                let steps = tree.steps_for_model(mpath)?;
                tree.reshape(tree.expand_flat(&chunks, &steps)?)
            }
        }
    }

    pub fn expand_query_path_flat(&self, qpath : &QueryPath) -> Result<Vec<QueryPath>> {
        match self {
            Dummy => Ok(vec![qpath.clone()]),
            Shaped(tree) => {
                let (chunks, _) = path::parts(qpath.as_str())?;
                let steps = tree.steps_for_query(qpath)?;
                tree.expand_flat(&chunks, &steps)
            }
        }
    }

    /// Group a flat list of values into the nested shape defined by the
    /// surviving node counts. A level whose nodes are all constrained
    /// collapses : `items[0].y` yields a scalar while `items[:].y`
    /// yields a list even when only one item survives.
    pub fn reshape<T>(&self, items : Vec<T>) -> Result<Nested<T>> {
        match self {
            Dummy => {
                let mut items = items;
                match items.len() {
                    1 => Ok(Nested::One(items.remove(0))),
                    n => Err(HubitError::Config(format!("expected one value for a context-free path, found {}", n)))
                }
            },
            Shaped(tree) => tree.reshape(items)
        }
    }

    /// The tree's shape filled with nulls; what a response looks like
    /// before any expanded path has delivered its value.
    pub fn none_like(&self) -> Result<Nested<Value>> {
        match self {
            Dummy => Ok(Nested::One(Value::Null)),
            Shaped(tree) => {
                if tree.all_constrained() {
                    return Ok(Nested::One(Value::Null))
                }
                tree.reshape(vec![Value::Null; tree.leaf_count()])
            }
        }
    }

    /// Child counts per node per level; two trees are equal iff these
    /// agree.
    pub fn to_shape(&self) -> Vec<Vec<usize>> {
        match self {
            Dummy => Vec::new(),
            Shaped(tree) => tree.levels
                                .iter()
                                .map(|ids| ids.iter().map(|id| tree.node(*id).children.len()).collect())
                                .collect()
        }
    }

    pub fn leaf_count(&self) -> usize {
        match self {
            Dummy => 1,
            Shaped(tree) => tree.leaf_count()
        }
    }

    /// Child counts at the level of the named identifier.
    pub fn children_at_level(&self, level_name : &str) -> Option<Vec<usize>> {
        match self {
            Dummy => None,
            Shaped(tree) => {
                let level = tree.level_names.iter().position(|name| name == level_name)?;
                Some(tree.levels[level].iter().map(|id| tree.node(*id).children.len()).collect())
            }
        }
    }
}

impl PartialEq for LengthTree {
    fn eq(&self, other : &LengthTree) -> bool {
        self.to_shape() == other.to_shape()
    }
}

impl ShapedTree {
    fn node(&self, id : NodeId) -> &LengthNode {
        self.arena[id].as_ref().unwrap()
    }

    fn node_mut(&mut self, id : NodeId) -> &mut LengthNode {
        self.arena[id].as_mut().unwrap()
    }

    fn root(&self) -> NodeId {
        self.levels[0][0]
    }

    fn build_node(
        &mut self,
        input : &Value,
        connecting : &[String],
        level : usize,
        prefix : String,
        parent : Option<NodeId>,
        index : usize,
        origin : &ModelPath,
    ) -> Result<NodeId> {
        let segments : Vec<&str> = prefix.split('.').collect();
        let list = input.dig(&segments)
                        .and_then(Value::as_list)
                        .ok_or_else(|| HubitError::Config(format!(
                            "input has no list at '{}' required by '{}'", prefix, origin
                        )))?;
        let n = list.len();

        let id = self.arena.len();
        self.arena.push(Some(LengthNode {
            parent,
            level,
            index,
            constrained : false,
            children : Leaves((0..n).collect()),
        }));
        self.levels[level].push(id);

        if level + 1 < connecting.len() {
            let mut child_ids = Vec::with_capacity(n);
            for child_idx in 0..n {
                let child_prefix = format!("{}.{}.{}", prefix, child_idx, connecting[level + 1]);
                let child_id = self.build_node(input, connecting, level + 1, child_prefix, Some(id), child_idx, origin)?;
                child_ids.push(child_id);
            }
            self.node_mut(id).children = Nodes(child_ids);
        }
        Ok(id)
    }

    /// Fix the nodes at a level to one index value; every other child
    /// is dropped, and a node that cannot provide the index is removed
    /// (transitively emptying parents is an error at the root).
    fn fix_at(&mut self, idx_value : usize, level : usize) -> Result<()> {
        let node_ids = self.levels[level].clone();
        let mut doomed = Vec::new();

        for id in node_ids {
            self.node_mut(id).constrained = true;
            let keeps = match &self.node(id).children {
                Leaves(idxs) => idxs.contains(&idx_value),
                Nodes(ids) => ids.iter().any(|cid| self.node(*cid).index == idx_value),
            };
            if keeps {
                self.drop_children_except(id, idx_value);
            } else {
                doomed.push(id);
            }
        }

        for id in doomed {
            // The node may already be gone as a descendant of an
            // earlier removal.
            if self.arena[id].is_none() {
                continue
            }
            self.remove_node(id).map_err(|_| HubitError::IndexOutOfRange {
                index : idx_value as i64,
                ident : self.level_names[level].clone(),
            })?;
        }
        Ok(())
    }

    fn drop_children_except(&mut self, id : NodeId, idx_value : usize) {
        match self.node(id).children.clone() {
            Leaves(idxs) => {
                let kept : Vec<usize> = idxs.into_iter().filter(|idx| *idx == idx_value).collect();
                self.node_mut(id).children = Leaves(kept);
            },
            Nodes(ids) => {
                let mut kept = Vec::with_capacity(1);
                for cid in ids {
                    if self.node(cid).index == idx_value {
                        kept.push(cid);
                    } else {
                        self.remove_subtree(cid);
                    }
                }
                self.node_mut(id).children = Nodes(kept);
            }
        }
    }

    fn remove_subtree(&mut self, id : NodeId) {
        if let Nodes(ids) = self.node(id).children.clone() {
            for cid in ids {
                self.remove_subtree(cid);
            }
        }
        let level = self.node(id).level;
        self.levels[level].retain(|other| *other != id);
        self.arena[id] = None;
    }

    /// Remove a node, detaching it from its parent; an emptied parent
    /// is removed in turn. Removing the root means the requested index
    /// exists nowhere, which the caller reports.
    fn remove_node(&mut self, id : NodeId) -> Result<()> {
        let parent = self.node(id).parent;
        self.remove_subtree(id);

        match parent {
            None => Err(HubitError::Config(String::from("pruned the tree away entirely"))),
            Some(pid) => {
                if let Nodes(ids) = self.node(pid).children.clone() {
                    let kept : Vec<NodeId> = ids.into_iter()
                                                .filter(|cid| self.arena[*cid].is_some())
                                                .collect();
                    self.node_mut(pid).children = Nodes(kept);
                }
                if self.node(pid).children.len() == 0 {
                    self.remove_node(pid)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn clip_at(&mut self, level_name : &str) -> Result<()> {
        let level = self.level_names
                        .iter()
                        .position(|name| name == level_name)
                        .ok_or_else(|| HubitError::Config(format!("index identifier '{}' not found in tree", level_name)))?;
        for id in self.levels[level].clone() {
            if let Nodes(ids) = self.node(id).children.clone() {
                for cid in &ids {
                    self.remove_subtree(*cid);
                }
                self.node_mut(id).children = Leaves((0..ids.len()).collect());
            }
        }
        self.level_names.truncate(level + 1);
        self.levels.truncate(level + 1);
        Ok(())
    }

    fn steps_for_query(&self, qpath : &QueryPath) -> Result<Vec<Step>> {
        let indices = qpath.indices()?;
        if indices.len() != self.levels.len() {
            return Err(HubitError::malformed(
                qpath.as_str(),
                format!("path does not match tree with levels {:?}", self.level_names),
            ))
        }
        indices.iter()
               .map(|idx| match idx {
                   QueryIndex::Wildcard => Ok(Step::ExpandAll),
                   QueryIndex::QDigit(d) if *d < 0 => Err(HubitError::malformed(qpath.as_str(), "negative index must be normalized before expansion")),
                   QueryIndex::QDigit(d) => Ok(Step::Fixed(*d as usize)),
               })
               .collect()
    }

    fn steps_for_model(&self, mpath : &ModelPath) -> Result<Vec<Step>> {
        let indices = mpath.indices()?;
        if indices.len() != self.levels.len() {
            return Err(HubitError::malformed(
                mpath.as_str(),
                format!("path does not match tree with levels {:?}", self.level_names),
            ))
        }
        indices.iter()
               .zip(self.level_names.iter())
               .map(|(idx, level_name)| match idx {
                   ModelIndex::Digit(d) => Ok(Step::Fixed(*d)),
                   ModelIndex::DigitId(d, _) => Ok(Step::Fixed(*d)),
                   ModelIndex::WildcardId(_) => Ok(Step::ExpandAll),
                   ModelIndex::Id(name) if name == level_name => Ok(Step::ExpandAll),
                   ModelIndex::Id(name) => Err(HubitError::malformed(
                       mpath.as_str(),
                       format!("unknown index identifier '{}' for levels {:?}", name, self.level_names),
                   )),
               })
               .collect()
    }

    /// Walk the levels breadth-first, multiplying out every `ExpandAll`
    /// against the surviving children. Returns concrete paths in leaf
    /// order; the public wrappers reshape when the tree's shape is
    /// wanted.
    fn expand_flat(&self, chunks : &[String], steps : &[Step]) -> Result<Vec<QueryPath>> {
        let mut cursors : Vec<(Vec<String>, Option<NodeId>)> = vec![(Vec::new(), Some(self.root()))];

        for (level, step) in steps.iter().enumerate() {
            let mut next = Vec::with_capacity(cursors.len());
            for (resolved, node_id) in cursors {
                let id = match node_id {
                    Some(id) => id,
                    None => return Err(HubitError::Config(String::from("expansion descended below the tree")))
                };
                let node = self.node(id);
                match step {
                    Step::Fixed(d) => {
                        let child = self.child_for_index(id, *d).ok_or(HubitError::IndexOutOfRange {
                            index : *d as i64,
                            ident : self.level_names[level].clone(),
                        })?;
                        let mut resolved = resolved;
                        resolved.push(d.to_string());
                        next.push((resolved, child));
                    },
                    Step::ExpandAll => {
                        match &node.children {
                            Leaves(idxs) => for idx in idxs {
                                let mut resolved = resolved.clone();
                                resolved.push(idx.to_string());
                                next.push((resolved, None));
                            },
                            Nodes(ids) => for cid in ids {
                                let mut resolved = resolved.clone();
                                resolved.push(self.node(*cid).index.to_string());
                                next.push((resolved, Some(*cid)));
                            }
                        }
                    }
                }
            }
            cursors = next;
        }

        Ok(cursors.into_iter()
                  .map(|(resolved, _)| QueryPath::new(path::rebuild(chunks, &resolved)))
                  .collect())
    }

    fn child_for_index(&self, id : NodeId, idx_value : usize) -> Option<Option<NodeId>> {
        match &self.node(id).children {
            Leaves(idxs) => {
                if idxs.contains(&idx_value) { Some(None) } else { None }
            },
            Nodes(ids) => ids.iter()
                             .find(|cid| self.node(**cid).index == idx_value)
                             .map(|cid| Some(*cid))
        }
    }

    fn reshape<T>(&self, items : Vec<T>) -> Result<Nested<T>> {
        let expected = self.leaf_count();
        if items.len() != expected {
            return Err(HubitError::Config(format!(
                "cannot reshape {} values into a tree with {} leaves", items.len(), expected
            )))
        }

        let top_constrained = self.node(self.root()).constrained;
        let mut as_list = !top_constrained;
        let mut cur : Vec<Nested<T>> = items.into_iter().map(Nested::One).collect();

        for level in (1..self.levels.len()).rev() {
            let ids = &self.levels[level];
            if ids.iter().all(|id| self.node(*id).constrained) {
                continue
            }
            as_list = true;
            let sizes : Vec<usize> = ids.iter().map(|id| self.node(*id).children.len()).collect();
            cur = split_items(cur, &sizes).into_iter().map(Nested::Many).collect();
        }

        if as_list {
            if top_constrained {
                Ok(cur.remove(0))
            } else {
                Ok(Nested::Many(cur))
            }
        } else {
            Ok(cur.remove(0))
        }
    }

    fn leaf_count(&self) -> usize {
        match self.levels.last() {
            Some(ids) => ids.iter().map(|id| self.node(*id).children.len()).sum(),
            None => 0
        }
    }

    fn all_constrained(&self) -> bool {
        self.levels
            .iter()
            .all(|ids| ids.iter().all(|id| self.node(*id).constrained))
    }

    fn normalize(&self, qpath : &QueryPath) -> Result<QueryPath> {
        let indices = qpath.indices()?;
        let (chunks, mut specs) = path::parts(qpath.as_str())?;
        if indices.len() != self.levels.len() {
            return Err(HubitError::malformed(
                qpath.as_str(),
                format!("path does not match tree with levels {:?}", self.level_names),
            ))
        }

        // Indices resolved so far; None once a wildcard interrupts the
        // chain of concrete positions.
        let mut resolved : Vec<usize> = Vec::new();
        let mut chain_intact = true;

        for (level, idx) in indices.iter().enumerate() {
            match idx {
                QueryIndex::Wildcard => chain_intact = false,
                QueryIndex::QDigit(d) if *d >= 0 => {
                    if chain_intact {
                        resolved.push(*d as usize);
                    }
                },
                QueryIndex::QDigit(d) => {
                    if !chain_intact {
                        return Err(HubitError::malformed(
                            qpath.as_str(),
                            "negative index after a wildcard cannot be normalized",
                        ))
                    }
                    let node = self.node_for_indices(&resolved, qpath)?;
                    let n = self.node(node).children.len() as i64;
                    let normalized = n + d;
                    if normalized < 0 {
                        return Err(HubitError::IndexOutOfRange {
                            index : *d,
                            ident : self.level_names[level].clone(),
                        })
                    }
                    specs[level] = normalized.to_string();
                    resolved.push(normalized as usize);
                }
            }
        }
        Ok(QueryPath::new(path::rebuild(&chunks, &specs)))
    }

    fn node_for_indices(&self, idxs : &[usize], origin : &QueryPath) -> Result<NodeId> {
        let mut id = self.root();
        for idx in idxs {
            id = match self.child_for_index(id, *idx) {
                Some(Some(cid)) => cid,
                _ => return Err(HubitError::malformed(
                    origin.as_str(),
                    format!("no node at index {} while resolving a negative index", idx),
                ))
            };
        }
        Ok(id)
    }
}

/// Compute the length tree for every index context reachable from the
/// given paths (the model's consumes-input bindings), plus the clipped
/// prefix contexts, keyed by context. The empty context maps to the
/// dummy tree.
pub fn forest_for_paths<'a>(
    paths : impl Iterator<Item = &'a ModelPath>,
    input : &Value,
) -> Result<HashMap<String, LengthTree>> {
    let mut out : HashMap<String, LengthTree> = HashMap::new();
    out.insert(String::new(), Dummy);

    for path in paths {
        let idx_context = path.idx_context();
        if out.contains_key(idx_context.as_str()) {
            continue
        }
        let tree = LengthTree::from_path(path, input)?;
        if tree.is_dummy() {
            continue
        }
        out.insert(idx_context, tree);
    }

    // Clip trees to cover the shallower prefix contexts as well.
    let built : Vec<LengthTree> = out.values().cloned().collect();
    for tree in built {
        let names = tree.level_names().to_vec();
        if names.len() < 2 {
            continue
        }
        for name in &names[..names.len() - 1] {
            let clipped = tree.clipped_at(name)?;
            let idx_context = clipped.idx_context();
            if !out.contains_key(idx_context.as_str()) {
                out.insert(idx_context, clipped);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(yml : &str) -> Value {
        serde_yaml::from_str(yml).unwrap()
    }

    /// Two segments with two and three walls.
    fn ragged_input() -> Value {
        value("{segs: [{walls: [{kval: 1}, {kval: 2}]}, {walls: [{kval: 3}, {kval: 7}, {kval: 5}]}]}")
    }

    fn ragged_tree() -> LengthTree {
        let mpath = ModelPath::new("segs[IDX_SEG].walls[IDX_WALL].kval");
        LengthTree::from_path(&mpath, &ragged_input()).unwrap()
    }

    #[test]
    fn builds_shape_from_input() {
        let tree = ragged_tree();
        assert_eq!(tree.to_shape(), vec![vec![2], vec![2, 3]]);
        assert_eq!(tree.idx_context(), "IDX_SEG-IDX_WALL");
        assert_eq!(tree.leaf_count(), 5);
    }

    #[test]
    fn dummy_for_no_identifiers() {
        let data = value("{weight: 1}");
        let tree = LengthTree::from_path(&ModelPath::new("weight"), &data).unwrap();
        assert!(tree.is_dummy());
        let tree = LengthTree::from_path(&ModelPath::new("segs[0].walls[1].kval"), &ragged_input()).unwrap();
        assert!(tree.is_dummy());
    }

    #[test]
    fn prune_fixes_levels() {
        let mut tree = ragged_tree();
        tree.prune_from_query(&QueryPath::new("segs[1].walls[:].kval")).unwrap();
        assert_eq!(tree.to_shape(), vec![vec![1], vec![3]]);

        let mut tree = ragged_tree();
        tree.prune_from_query(&QueryPath::new("segs[:].walls[1].kval")).unwrap();
        assert_eq!(tree.to_shape(), vec![vec![2], vec![1, 1]]);
    }

    #[test]
    fn prune_out_of_range() {
        let mut tree = ragged_tree();
        let err = tree.prune_from_query(&QueryPath::new("segs[4].walls[:].kval"));
        match err {
            Err(HubitError::IndexOutOfRange { index, ident }) => {
                assert_eq!(index, 4);
                assert_eq!(ident, "IDX_SEG");
            },
            other => panic!("expected IndexOutOfRange, got {:?}", other)
        }
    }

    #[test]
    fn prune_drops_short_branches() {
        // walls[2] exists only on the second segment, so the first
        // segment disappears from the pruned tree
        let mut tree = ragged_tree();
        tree.prune_from_query(&QueryPath::new("segs[:].walls[2].kval")).unwrap();
        assert_eq!(tree.to_shape(), vec![vec![1], vec![1]]);
    }

    #[test]
    fn expand_all_wildcards() {
        let tree = ragged_tree();
        let paths = tree.expand_query_path_flat(&QueryPath::new("segs[:].walls[:].kval")).unwrap();
        let raw : Vec<&str> = paths.iter().map(|p| p.as_str()).collect();
        assert_eq!(raw, vec![
            "segs[0].walls[0].kval",
            "segs[0].walls[1].kval",
            "segs[1].walls[0].kval",
            "segs[1].walls[1].kval",
            "segs[1].walls[2].kval",
        ]);
    }

    #[test]
    fn expand_after_prune_keeps_original_indices() {
        let mut tree = ragged_tree();
        let qpath = QueryPath::new("segs[1].walls[:].kval");
        tree.prune_from_query(&qpath).unwrap();
        let paths = tree.expand_query_path_flat(&qpath).unwrap();
        let raw : Vec<&str> = paths.iter().map(|p| p.as_str()).collect();
        assert_eq!(raw, vec![
            "segs[1].walls[0].kval",
            "segs[1].walls[1].kval",
            "segs[1].walls[2].kval",
        ]);
    }

    #[test]
    fn expansion_count_matches_surviving_children() {
        // |expand| = product of surviving child counts along wildcard
        // levels
        let tree = ragged_tree();
        let paths = tree.expand_query_path_flat(&QueryPath::new("segs[:].walls[:].kval")).unwrap();
        assert_eq!(paths.len(), tree.leaf_count());
    }

    #[test]
    fn reshape_inverts_flat_expansion() {
        let mut tree = ragged_tree();
        let qpath = QueryPath::new("segs[:].walls[:].kval");
        tree.prune_from_query(&qpath).unwrap();
        let flat = tree.expand_query_path_flat(&qpath).unwrap();
        let shaped = tree.expand_query_path(&qpath).unwrap();
        assert_eq!(tree.reshape(flat).unwrap(), shaped);
    }

    #[test]
    fn reshape_collapses_constrained_levels() {
        // segs[0].walls[:] : one dimension, segs[:].walls[:] : two
        let mut tree = ragged_tree();
        tree.prune_from_query(&QueryPath::new("segs[0].walls[:].kval")).unwrap();
        let shaped = tree.reshape(vec![1, 2]).unwrap();
        assert_eq!(shaped, Nested::Many(vec![Nested::One(1), Nested::One(2)]));

        // fully fixed : scalar
        let mut tree = ragged_tree();
        tree.prune_from_query(&QueryPath::new("segs[0].walls[1].kval")).unwrap();
        let shaped = tree.reshape(vec![42]).unwrap();
        assert_eq!(shaped, Nested::One(42));
    }

    #[test]
    fn none_like_matches_shape() {
        let mut tree = ragged_tree();
        tree.prune_from_query(&QueryPath::new("segs[:].walls[:].kval")).unwrap();
        let nulls = tree.none_like().unwrap();
        assert_eq!(nulls.count(), 5);

        let mut tree = ragged_tree();
        tree.prune_from_query(&QueryPath::new("segs[1].walls[2].kval")).unwrap();
        assert_eq!(tree.none_like().unwrap(), Nested::One(Value::Null));
    }

    #[test]
    fn normalize_negative_indices() {
        let tree = ragged_tree();
        let normalized = tree.normalize(&QueryPath::new("segs[-1].walls[-1].kval")).unwrap();
        assert_eq!(normalized.as_str(), "segs[1].walls[2].kval");

        let normalized = tree.normalize(&QueryPath::new("segs[0].walls[-1].kval")).unwrap();
        assert_eq!(normalized.as_str(), "segs[0].walls[1].kval");

        assert!(tree.normalize(&QueryPath::new("segs[-3].walls[0].kval")).is_err());
    }

    #[test]
    fn clip_produces_prefix_context() {
        let tree = ragged_tree();
        let clipped = tree.clipped_at("IDX_SEG").unwrap();
        assert_eq!(clipped.idx_context(), "IDX_SEG");
        assert_eq!(clipped.to_shape(), vec![vec![2]]);
    }

    #[test]
    fn forest_covers_contexts_and_prefixes() {
        let paths = vec![
            ModelPath::new("segs[IDX_SEG].walls[IDX_WALL].kval"),
            ModelPath::new("weight"),
        ];
        let forest = forest_for_paths(paths.iter(), &ragged_input()).unwrap();
        assert!(forest.contains_key(""));
        assert!(forest.contains_key("IDX_SEG"));
        assert!(forest.contains_key("IDX_SEG-IDX_WALL"));
    }

    #[test]
    fn model_path_expansion_iterates_identifiers() {
        let mut tree = ragged_tree();
        let mpath = ModelPath::new("segs[0].walls[IDX_WALL].kval");
        tree.prune_from_model(&mpath).unwrap();
        let paths = tree.expand_model_path(&mpath).unwrap().into_flatten();
        let raw : Vec<&str> = paths.iter().map(|p| p.as_str()).collect();
        assert_eq!(raw, vec!["segs[0].walls[0].kval", "segs[0].walls[1].kval"]);
    }
}
