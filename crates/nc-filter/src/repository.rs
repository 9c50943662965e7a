use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::mem;

use nc_cache::{ListOptions, MetaCache, entity_key, list_key};
use nc_condition::{ConditionRule, validate_condition};
use nc_meta::{Condition, ListArgs, MetaContext, MetaRow, MetaStore, MetaTable, SortDirection};
use nc_types::{CacheDelDirection, CacheScope, ComparisonOp, LogicalOp};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::model::{Filter, FilterDraft, FilterObject, FilterOwner, FilterPatch, ParentRef};
use crate::{FilterError, filter_key};

const ORDER_FIELD: &str = "order";
const SINGLE_QUERY_KINDS: [&str; 3] = ["queries", "count", "read"];

/// Filter persistence over a metadata store, cached through a [`MetaCache`].
///
/// Writes go to the store first; the cache only ever mirrors rows the store
/// has accepted.
pub struct FilterRepository<'a> {
    cache: &'a MetaCache,
    meta: &'a dyn MetaStore,
    context: MetaContext,
}

enum Step {
    Expand(Filter),
    Remove(Filter),
}

impl<'a> FilterRepository<'a> {
    pub fn new(cache: &'a MetaCache, meta: &'a dyn MetaStore, context: MetaContext) -> Self {
        Self {
            cache,
            meta,
            context,
        }
    }

    #[must_use]
    pub fn context(&self) -> &MetaContext {
        &self.context
    }

    /// Inserts `draft` and, breadth first, all of its children. Returns the
    /// stored root.
    pub fn insert(&self, mut draft: FilterDraft) -> Result<Filter, FilterError> {
        let owner = draft.owner()?;
        let (project_id, base_id) = match (draft.project_id.take(), draft.base_id.take()) {
            (Some(project_id), Some(base_id)) => (Some(project_id), Some(base_id)),
            (project_id, base_id) => {
                let owner_row = self
                    .owner_row(&owner)?
                    .ok_or_else(|| FilterError::OwnerNotFound {
                        kind: owner.kind(),
                        id: owner.id().to_owned(),
                    })?;
                (
                    project_id.or_else(|| text_field(&owner_row, "project_id")),
                    base_id.or_else(|| text_field(&owner_row, "base_id")),
                )
            }
        };
        let scope = InsertScope {
            owner: &owner,
            project_id: project_id.as_deref(),
            base_id: base_id.as_deref(),
        };

        let children = mem::take(&mut draft.children);
        let root = self.insert_node(&scope, draft)?;
        let mut pending = children
            .into_iter()
            .map(|child| (child, root.id.clone()))
            .collect::<VecDeque<_>>();
        while let Some((mut node, parent_id)) = pending.pop_front() {
            node.fk_parent_id = Some(parent_id);
            let grandchildren = mem::take(&mut node.children);
            let inserted = self.insert_node(&scope, node)?;
            pending.extend(
                grandchildren
                    .into_iter()
                    .map(|child| (child, inserted.id.clone())),
            );
        }

        if let FilterOwner::View(view_id) = &owner {
            self.clear_single_query_cache(view_id)?;
        }
        Ok(root)
    }

    fn insert_node(
        &self,
        scope: &InsertScope<'_>,
        draft: FilterDraft,
    ) -> Result<Filter, FilterError> {
        if let Some(column_id) = draft.fk_column_id.as_deref() {
            if self.column_row(column_id)?.is_none() {
                return Err(FilterError::DanglingColumn(column_id.to_owned()));
            }
        }
        let owner = scope.owner;
        let order = self.meta.meta_get_next_order(
            &self.context,
            MetaTable::FilterExp,
            &owner_condition(owner),
        )?;

        let mut filter = Filter {
            id: draft.id.unwrap_or_default(),
            fk_column_id: draft.fk_column_id,
            fk_parent_id: draft.fk_parent_id,
            comparison_op: draft.comparison_op,
            comparison_sub_op: draft.comparison_sub_op,
            value: draft.value,
            is_group: draft.is_group,
            logical_op: draft.logical_op,
            order: Some(order),
            project_id: scope.project_id.map(str::to_owned),
            base_id: scope.base_id.map(str::to_owned),
            ..Filter::default()
        };
        match owner {
            FilterOwner::View(id) => filter.fk_view_id = Some(id.clone()),
            FilterOwner::Hook(id) => filter.fk_hook_id = Some(id.clone()),
        }

        let row = self
            .meta
            .meta_insert(&self.context, MetaTable::FilterExp, filter.to_row()?)?;
        let inserted = Filter::from_row(row.clone())?;
        self.cache_inserted(owner, &inserted, row);
        debug!(filter = %inserted.id, owner = owner.id(), "filter inserted");
        Ok(inserted)
    }

    /// Caches the new row and links it into every list that is already warm.
    fn cache_inserted(&self, owner: &FilterOwner, filter: &Filter, row: MetaRow) {
        let key = filter.cache_key();
        self.cache.set(&key, &Value::Object(row));
        let scope = CacheScope::FilterExp;
        self.cache.append_to_list(scope, &[owner.id()], &key);
        if let Some(parent_id) = filter.fk_parent_id.as_deref() {
            self.cache.append_to_list(scope, &[owner.id(), parent_id], &key);
            self.cache.append_to_list(scope, &[parent_id], &key);
        }
        if let Some(column_id) = filter.fk_column_id.as_deref() {
            self.cache.append_to_list(scope, &[column_id], &key);
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Filter>, FilterError> {
        let key = filter_key(id);
        if let Some(object) = self.cache.get_object(&key) {
            return Filter::from_row(object).map(Some);
        }
        let Some(row) = self.meta.meta_get(&self.context, MetaTable::FilterExp, id)? else {
            return Ok(None);
        };
        self.cache.set(&key, &Value::Object(row.clone()));
        Filter::from_row(row).map(Some)
    }

    /// Applies `patch` to the stored row, then to the cached copy if any.
    pub fn update(&self, id: &str, patch: &FilterPatch) -> Result<Filter, FilterError> {
        let previous = if patch.fk_parent_id.is_some() || patch.fk_column_id.is_some() {
            self.get(id)?
        } else {
            None
        };
        let row = self
            .meta
            .meta_update(&self.context, MetaTable::FilterExp, id, &patch.to_row())?
            .ok_or_else(|| FilterError::NotFound(id.to_owned()))?;
        self.cache.update(&filter_key(id), &row);
        let updated = Filter::from_row(row)?;

        if let Some(previous) = previous {
            if previous.fk_parent_id != updated.fk_parent_id {
                self.forget_ancestry(&previous);
                self.forget_ancestry(&updated);
            }
            if previous.fk_column_id != updated.fk_column_id {
                let keys = [&previous.fk_column_id, &updated.fk_column_id]
                    .into_iter()
                    .flatten()
                    .map(|column_id| list_key(CacheScope::FilterExp, &[column_id.as_str()]))
                    .collect::<Vec<_>>();
                self.cache.del_many(&keys);
            }
        }
        if let Some(view_id) = updated.fk_view_id.as_deref() {
            self.clear_single_query_cache(view_id)?;
        }
        Ok(updated)
    }

    /// Drops the parent lists a node is linked into so they are rebuilt
    /// from the store.
    fn forget_ancestry(&self, filter: &Filter) {
        let Some(parent_id) = filter.fk_parent_id.as_deref() else {
            return;
        };
        let mut keys = vec![list_key(CacheScope::FilterExp, &[parent_id])];
        if let Some(owner) = filter.owner() {
            keys.push(list_key(CacheScope::FilterExp, &[owner.id(), parent_id]));
        }
        self.cache.del_many(&keys);
    }

    /// Deletes the filter and its whole subtree, children before parents.
    /// Returns `false` when the filter does not exist.
    pub fn delete(&self, id: &str) -> Result<bool, FilterError> {
        let Some(filter) = self.get(id)? else {
            return Ok(false);
        };
        let view_id = filter.fk_view_id.clone();
        self.delete_subtrees(vec![filter])?;
        if let Some(view_id) = view_id.as_deref() {
            self.clear_single_query_cache(view_id)?;
        }
        Ok(true)
    }

    /// Deletes every filter of `owner`. Returns the number of nodes removed.
    pub fn delete_all(&self, owner: &FilterOwner) -> Result<usize, FilterError> {
        let tree = self.get_filter_object(owner)?;
        let mut removed = self.delete_subtrees(tree.children)?;
        // Nodes the tree dropped as orphans are still listed under the owner.
        let leftovers = self.owner_filter_list(owner)?;
        removed += self.delete_subtrees(leftovers)?;
        self.cache.del(&list_key(CacheScope::FilterExp, &[owner.id()]));
        if let FilterOwner::View(view_id) = owner {
            self.clear_single_query_cache(view_id)?;
        }
        Ok(removed)
    }

    fn delete_subtrees(&self, roots: Vec<Filter>) -> Result<usize, FilterError> {
        let mut stack = roots.into_iter().rev().map(Step::Expand).collect::<Vec<_>>();
        let mut visited = BTreeSet::new();
        let mut removed = 0;
        while let Some(step) = stack.pop() {
            match step {
                Step::Remove(filter) => {
                    self.delete_node(&filter)?;
                    removed += 1;
                }
                Step::Expand(filter) => {
                    if !visited.insert(filter.id.clone()) {
                        continue;
                    }
                    let children = if filter.is_self_parented() {
                        warn!(filter = %filter.id, "filter is its own parent, not descending");
                        Vec::new()
                    } else {
                        self.children(&filter)?
                    };
                    stack.push(Step::Remove(filter));
                    stack.extend(children.into_iter().rev().map(Step::Expand));
                }
            }
        }
        Ok(removed)
    }

    fn delete_node(&self, filter: &Filter) -> Result<(), FilterError> {
        self.meta
            .meta_delete(&self.context, MetaTable::FilterExp, &filter.id)?;
        let scope = CacheScope::FilterExp;
        self.cache
            .deep_del(scope, &filter.cache_key(), CacheDelDirection::ChildToParent);
        let mut lists = vec![list_key(scope, &[filter.id.as_str()])];
        if let Some(owner) = filter.owner() {
            lists.push(list_key(scope, &[owner.id(), filter.id.as_str()]));
        }
        self.cache.del_many(&lists);
        debug!(filter = %filter.id, "filter deleted");
        Ok(())
    }

    /// Rebuilds the owner's filters into a tree under an implicit `and`
    /// root. Nodes whose parent is not among the owner's filters are dropped.
    pub fn get_filter_object(&self, owner: &FilterOwner) -> Result<FilterObject, FilterError> {
        let filters = self.owner_filter_list(owner)?;
        let positions = filters
            .iter()
            .enumerate()
            .map(|(index, filter)| (filter.id.clone(), index))
            .collect::<BTreeMap<_, _>>();

        let mut roots = Vec::new();
        let mut children_of = vec![Vec::new(); filters.len()];
        for (index, filter) in filters.iter().enumerate() {
            match filter.fk_parent_id.as_deref() {
                None => roots.push(index),
                Some(parent_id) => match positions.get(parent_id) {
                    Some(&parent) if parent != index => children_of[parent].push(index),
                    _ => {}
                },
            }
        }

        let mut preorder = Vec::with_capacity(filters.len());
        let mut seen = vec![false; filters.len()];
        let mut stack = roots.iter().rev().copied().collect::<Vec<_>>();
        while let Some(index) = stack.pop() {
            if mem::replace(&mut seen[index], true) {
                continue;
            }
            preorder.push(index);
            stack.extend(children_of[index].iter().rev().copied());
        }
        let dropped = filters.len() - preorder.len();
        if dropped > 0 {
            warn!(owner = owner.id(), dropped, "filters with unreachable parents dropped");
        }

        let mut slots = filters.into_iter().map(Some).collect::<Vec<_>>();
        for &index in preorder.iter().rev() {
            let children = children_of[index]
                .iter()
                .filter_map(|&child| slots[child].take())
                .collect::<Vec<_>>();
            if let Some(filter) = slots[index].as_mut() {
                filter.children = children;
            }
        }
        Ok(FilterObject {
            children: roots.iter().filter_map(|&root| slots[root].take()).collect(),
            ..FilterObject::default()
        })
    }

    /// Every filter of `owner`, ordered by `order`.
    pub fn owner_filter_list(&self, owner: &FilterOwner) -> Result<Vec<Filter>, FilterError> {
        self.cached_list(&[owner.id()], owner_condition(owner))
    }

    pub fn root_filter_list(&self, owner: &FilterOwner) -> Result<Vec<Filter>, FilterError> {
        Ok(self
            .owner_filter_list(owner)?
            .into_iter()
            .filter(|filter| filter.fk_parent_id.is_none())
            .collect())
    }

    pub fn parent_filter_list(&self, parent_id: &str) -> Result<Vec<Filter>, FilterError> {
        self.cached_list(
            &[parent_id],
            Condition::new().where_eq("fk_parent_id", parent_id),
        )
    }

    pub fn parent_filter_list_by_hook(
        &self,
        hook_id: &str,
        parent_id: &str,
    ) -> Result<Vec<Filter>, FilterError> {
        self.cached_list(
            &[hook_id, parent_id],
            Condition::new()
                .where_eq("fk_parent_id", parent_id)
                .where_eq("fk_hook_id", hook_id),
        )
    }

    /// Filters testing `column_id`, across owners.
    pub fn column_filter_list(&self, column_id: &str) -> Result<Vec<Filter>, FilterError> {
        self.cached_list(
            &[column_id],
            Condition::new().where_eq("fk_column_id", column_id),
        )
    }

    fn cached_list(
        &self,
        sub_keys: &[&str],
        condition: Condition,
    ) -> Result<Vec<Filter>, FilterError> {
        let scope = CacheScope::FilterExp;
        let cached = self
            .cache
            .get_list_with(scope, sub_keys, &ListOptions::ordered_by(ORDER_FIELD));
        let rows = if cached.is_miss() {
            let rows = self.meta.meta_list(
                &self.context,
                MetaTable::FilterExp,
                &ListArgs::filtered(condition).order_by(ORDER_FIELD, SortDirection::Asc),
            )?;
            self.cache.set_list(scope, sub_keys, &rows);
            rows
        } else {
            cached.list
        };
        rows.into_iter().map(Filter::from_row).collect()
    }

    /// Direct children of a group; pre-attached children win.
    pub fn children(&self, filter: &Filter) -> Result<Vec<Filter>, FilterError> {
        if !filter.children.is_empty() {
            return Ok(filter.children.clone());
        }
        if !filter.is_group {
            return Ok(Vec::new());
        }
        self.parent_filter_list(&filter.id)
    }

    /// The group `filter` is nested in.
    pub fn group(&self, filter: &Filter) -> Result<Option<Filter>, FilterError> {
        match filter.fk_parent_id.as_deref() {
            Some(parent_id) => self.get(parent_id),
            None => Ok(None),
        }
    }

    /// Whether any filter of the project tests for null or emptiness.
    pub fn has_empty_or_null_filters(&self, project_id: &str) -> Result<bool, FilterError> {
        let tests = [
            ComparisonOp::Null,
            ComparisonOp::NotNull,
            ComparisonOp::Empty,
            ComparisonOp::NotEmpty,
        ];
        let args = ListArgs::filtered(Condition::new().where_eq("project_id", project_id)).any_of(
            tests
                .iter()
                .map(|op| Condition::new().where_eq("comparison_op", op.as_str()))
                .collect(),
        );
        Ok(!self
            .meta
            .meta_list(&self.context, MetaTable::FilterExp, &args)?
            .is_empty())
    }

    /// Rewrites `logical_op` on the view's root filters or on a group's
    /// children. Returns how many filters were updated.
    pub fn update_all_children_logical_op(
        &self,
        view_id: &str,
        parent: &ParentRef,
        logical_op: LogicalOp,
    ) -> Result<usize, FilterError> {
        let targets = match parent {
            ParentRef::Root => self.root_filter_list(&FilterOwner::View(view_id.to_owned()))?,
            ParentRef::Group(group_id) => {
                let group = self
                    .get(group_id)?
                    .ok_or_else(|| FilterError::NotFound(group_id.clone()))?;
                if !group.is_group {
                    return Ok(0);
                }
                self.children(&group)?
            }
        };
        let patch = FilterPatch::logical_op(logical_op);
        for target in &targets {
            self.update(&target.id, &patch)?;
        }
        Ok(targets.len())
    }

    /// Evaluator rules for `filters`, each column resolved to its title.
    pub fn condition_rules(&self, filters: &[Filter]) -> Result<Vec<ConditionRule>, FilterError> {
        filters
            .iter()
            .map(|filter| {
                let field = match filter.fk_column_id.as_deref() {
                    Some(column_id) => {
                        let column = self
                            .column_row(column_id)?
                            .ok_or_else(|| FilterError::DanglingColumn(column_id.to_owned()))?;
                        text_field(&column, "title")
                    }
                    None => None,
                };
                Ok(ConditionRule {
                    logical_op: filter.logical_op.clone(),
                    comparison_op: filter.comparison_op.clone(),
                    field,
                    value: filter.value.clone(),
                })
            })
            .collect()
    }

    /// Whether `row` passes the hook's root filters.
    pub fn hook_matches(
        &self,
        hook_id: &str,
        row: &Map<String, Value>,
    ) -> Result<bool, FilterError> {
        let filters = self.root_filter_list(&FilterOwner::Hook(hook_id.to_owned()))?;
        let rules = self.condition_rules(&filters)?;
        Ok(validate_condition(&rules, row))
    }

    /// Evicts the cached query results of a view and of its model's default
    /// view.
    fn clear_single_query_cache(&self, view_id: &str) -> Result<(), FilterError> {
        let Some(view) = self.cached_row(CacheScope::View, MetaTable::Views, view_id)? else {
            return Ok(());
        };
        let Some(model_id) = text_field(&view, "fk_model_id") else {
            return Ok(());
        };
        let mut keys = Vec::with_capacity(2 * SINGLE_QUERY_KINDS.len());
        for view in [view_id, "default"] {
            for kind in SINGLE_QUERY_KINDS {
                keys.push(entity_key(
                    CacheScope::SingleQuery,
                    &format!("{model_id}:{view}:{kind}"),
                ));
            }
        }
        self.cache.del_many(&keys);
        Ok(())
    }

    fn owner_row(&self, owner: &FilterOwner) -> Result<Option<MetaRow>, FilterError> {
        match owner {
            FilterOwner::View(id) => self.cached_row(CacheScope::View, MetaTable::Views, id),
            FilterOwner::Hook(id) => self.cached_row(CacheScope::Hook, MetaTable::Hooks, id),
        }
    }

    fn column_row(&self, column_id: &str) -> Result<Option<MetaRow>, FilterError> {
        self.cached_row(CacheScope::Column, MetaTable::Columns, column_id)
    }

    fn cached_row(
        &self,
        scope: CacheScope,
        table: MetaTable,
        id: &str,
    ) -> Result<Option<MetaRow>, FilterError> {
        let key = entity_key(scope, id);
        if let Some(row) = self.cache.get_object(&key) {
            return Ok(Some(row));
        }
        let row = self.meta.meta_get(&self.context, table, id)?;
        if let Some(row) = &row {
            self.cache.set(&key, &Value::Object(row.clone()));
        }
        Ok(row)
    }
}

struct InsertScope<'s> {
    owner: &'s FilterOwner,
    project_id: Option<&'s str>,
    base_id: Option<&'s str>,
}

fn owner_condition(owner: &FilterOwner) -> Condition {
    Condition::new().where_eq(owner.column(), owner.id())
}

fn text_field(row: &MetaRow, field: &str) -> Option<String> {
    row.get(field).and_then(Value::as_str).map(str::to_owned)
}
