use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use std::collections::{HashMap, HashSet};
use tracing::info;

use super::PermissionSet;
use crate::error::{AppError, AppResult};
use crate::model::Permission;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuNode {
    pub id: i32,
    pub code: String,
    pub name: String,
    pub title: String,
    pub path: String,
    pub icon: String,
    pub order: i32,
    pub children: Vec<MenuNode>,
}

/// Assemble menu rows into a forest.
///
/// A row whose parent is absent from `rows` becomes a root, as does every row
/// sitting on a parent cycle. Siblings are ordered by `(menu_order, id)`.
pub fn build_menu_forest(rows: Vec<Permission>) -> Vec<MenuNode> {
    let rows: HashMap<i32, Permission> = rows
        .into_iter()
        .filter(|p| p.is_menu)
        .map(|p| (p.id, p))
        .collect();

    let parent_of: HashMap<i32, Option<i32>> = rows.iter().map(|(id, p)| (*id, p.parent_menu_id)).collect();

    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    let mut roots = Vec::new();

    for (&id, row) in &rows {
        match row.parent_menu_id {
            Some(parent) if rows.contains_key(&parent) && !on_cycle(&parent_of, id) => {
                children.entry(parent).or_default().push(id);
            }
            _ => roots.push(id),
        }
    }

    let key = |id: &i32| (rows[id].menu_order, *id);
    roots.sort_by_key(key);
    for list in children.values_mut() {
        list.sort_by_key(key);
    }

    roots.iter().map(|id| assemble(*id, &rows, &children)).collect()
}

fn assemble(id: i32, rows: &HashMap<i32, Permission>, children: &HashMap<i32, Vec<i32>>) -> MenuNode {
    let row = &rows[&id];
    MenuNode {
        id,
        code: row.code.clone(),
        name: row.name.clone(),
        title: row.menu_title.clone(),
        path: row.menu_path.clone(),
        icon: row.menu_icon.clone(),
        order: row.menu_order,
        children: children
            .get(&id)
            .map(|list| list.iter().map(|c| assemble(*c, rows, children)).collect())
            .unwrap_or_default(),
    }
}

/// Whether following parent links from `id` leads back to `id`
fn on_cycle(parent_of: &HashMap<i32, Option<i32>>, id: i32) -> bool {
    let mut seen = HashSet::new();
    let mut cursor = parent_of.get(&id).copied().flatten();
    while let Some(current) = cursor {
        if current == id {
            return true;
        }
        if !seen.insert(current) {
            return false;
        }
        cursor = parent_of.get(&current).copied().flatten();
    }
    false
}

/// Whether re-parenting `id` under `new_parent` would close a loop
pub fn creates_menu_cycle(parent_of: &HashMap<i32, Option<i32>>, id: i32, new_parent: i32) -> bool {
    if id == new_parent {
        return true;
    }
    let mut seen = HashSet::new();
    let mut cursor = Some(new_parent);
    while let Some(current) = cursor {
        if current == id {
            return true;
        }
        if !seen.insert(current) {
            return false;
        }
        cursor = parent_of.get(&current).copied().flatten();
    }
    false
}

/// Menu forest visible to a caller holding `permissions`
pub async fn load_menu_tree(conn: &mut PgConnection, permissions: &PermissionSet) -> AppResult<Vec<MenuNode>> {
    let rows = sqlx::query_as::<_, Permission>(
        "SELECT id, code, name, status, menu_path, menu_icon, menu_title, parent_menu_id, menu_order, is_menu
         FROM permissions
         WHERE is_menu = TRUE AND status = 1 AND deleted_at IS NULL",
    )
    .fetch_all(conn)
    .await?;

    let visible = rows.into_iter().filter(|p| permissions.contains(&p.code)).collect();
    Ok(build_menu_forest(visible))
}

/// Move a menu permission under `parent` (or to the top level)
pub async fn set_menu_parent(pool: &PgPool, id: i32, parent: Option<i32>) -> AppResult<()> {
    let mut tx = pool.begin().await?;

    // Serialize concurrent re-parenting so the cycle check sees a stable graph
    sqlx::query("LOCK TABLE permissions IN SHARE ROW EXCLUSIVE MODE")
        .execute(&mut *tx)
        .await?;

    let edges: Vec<(i32, Option<i32>)> =
        sqlx::query_as("SELECT id, parent_menu_id FROM permissions WHERE deleted_at IS NULL")
            .fetch_all(&mut *tx)
            .await?;
    let parent_of: HashMap<i32, Option<i32>> = edges.into_iter().collect();

    if !parent_of.contains_key(&id) {
        return Err(AppError::not_found("permission"));
    }

    if let Some(parent) = parent {
        if !parent_of.contains_key(&parent) {
            return Err(AppError::not_found("parent permission"));
        }
        if creates_menu_cycle(&parent_of, id, parent) {
            return Err(AppError::InvalidArgument("menu parent would create a cycle".to_string()));
        }
    }

    sqlx::query("UPDATE permissions SET parent_menu_id = $1, updated_at = now() WHERE id = $2")
        .bind(parent)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    info!("Permission {} moved under {:?}", id, parent);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn menu(id: i32, code: &str, parent: Option<i32>, order: i32) -> Permission {
        Permission {
            id,
            code: code.to_string(),
            name: code.to_string(),
            status: 1,
            menu_path: format!("/{code}"),
            menu_icon: String::new(),
            menu_title: code.to_uppercase(),
            parent_menu_id: parent,
            menu_order: order,
            is_menu: true,
        }
    }

    /// Render a forest as `code:[child,...]` for compact assertions
    fn shape(nodes: &[MenuNode]) -> String {
        nodes
            .iter()
            .map(|n| {
                if n.children.is_empty() {
                    n.code.clone()
                } else {
                    format!("{}:[{}]", n.code, shape(&n.children))
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn codes(set: &[&str]) -> PermissionSet {
        PermissionSet::Codes(set.iter().map(|s| s.to_string()).collect())
    }

    fn sample() -> Vec<Permission> {
        vec![menu(1, "a", None, 0), menu(2, "b", Some(1), 0), menu(3, "c", Some(99), 0)]
    }

    #[test]
    fn test_admin_sees_full_forest_with_orphan_promoted() {
        let forest = build_menu_forest(sample());
        assert_eq!(shape(&forest), "a:[b], c");
    }

    #[test]
    fn test_restricted_caller_sees_only_granted_rows() {
        let granted = codes(&["c"]);
        let visible = sample().into_iter().filter(|p| granted.contains(&p.code)).collect();
        assert_eq!(shape(&build_menu_forest(visible)), "c");

        let granted = codes(&["b"]);
        let visible = sample().into_iter().filter(|p| granted.contains(&p.code)).collect();
        assert_eq!(shape(&build_menu_forest(visible)), "b");
    }

    #[test]
    fn test_no_menu_permissions_yields_empty_forest() {
        let granted = codes(&[]);
        let visible: Vec<Permission> = sample().into_iter().filter(|p| granted.contains(&p.code)).collect();
        assert!(build_menu_forest(visible).is_empty());
    }

    #[test]
    fn test_siblings_sort_by_order_then_id() {
        let rows = vec![
            menu(5, "e", None, 2),
            menu(4, "d", None, 1),
            menu(3, "c", None, 1),
            menu(2, "b", Some(3), 9),
            menu(1, "a", Some(3), 9),
        ];
        assert_eq!(shape(&build_menu_forest(rows)), "c:[a, b], d, e");
    }

    #[test]
    fn test_cycle_members_become_roots() {
        let rows = vec![menu(1, "a", Some(2), 0), menu(2, "b", Some(1), 0), menu(3, "c", Some(1), 0)];
        let forest = build_menu_forest(rows);
        assert_eq!(shape(&forest), "a:[c], b");
    }

    #[test]
    fn test_non_menu_rows_are_ignored() {
        let mut hidden = menu(7, "hidden", None, 0);
        hidden.is_menu = false;
        let forest = build_menu_forest(vec![hidden, menu(8, "shown", Some(7), 0)]);
        assert_eq!(shape(&forest), "shown");
    }

    #[test]
    fn test_creates_menu_cycle() {
        let parent_of: HashMap<i32, Option<i32>> = [(1, None), (2, Some(1)), (3, Some(2))].into_iter().collect();
        assert!(creates_menu_cycle(&parent_of, 1, 3));
        assert!(creates_menu_cycle(&parent_of, 2, 2));
        assert!(!creates_menu_cycle(&parent_of, 3, 1));
    }
}
