use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use runbook_core::{
    new_id, now_millis, Category, CategoryItem, CategoryItemType, CategoryStore,
};

use crate::{
    bool_to_sql, collect_rows, conversion_error, invalid_argument, not_found, placeholders,
    text_values, write_error, SqliteStore,
};

const CATEGORY_COLUMNS: &str =
    "id, name, team_id, user_id, collapsed, create_at, update_at, delete_at";

fn map_category_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        name: row.get(1)?,
        team_id: row.get(2)?,
        user_id: row.get(3)?,
        collapsed: row.get::<_, i64>(4)? != 0,
        create_at: row.get(5)?,
        update_at: row.get(6)?,
        delete_at: row.get(7)?,
        items: Vec::new(),
    })
}

fn attach_items(conn: &Connection, categories: &mut [Category]) -> Result<()> {
    if categories.is_empty() {
        return Ok(());
    }
    let ids: Vec<String> = categories.iter().map(|category| category.id.clone()).collect();
    let mut stmt = conn.prepare(&format!(
        "SELECT category_id, item_id, item_type FROM category_items
         WHERE category_id IN ({})
         ORDER BY category_id ASC, item_id ASC, item_type ASC",
        placeholders(ids.len())
    ))?;
    let rows = stmt.query_map(params_from_iter(text_values(&ids)), |row| {
        let raw_type: String = row.get(2)?;
        let item_type = CategoryItemType::parse(&raw_type).ok_or_else(|| {
            conversion_error(2, Type::Text, format!("invalid category item type: {raw_type}"))
        })?;
        Ok((
            row.get::<_, String>(0)?,
            CategoryItem {
                item_id: row.get(1)?,
                item_type,
            },
        ))
    })?;
    let mut items: BTreeMap<String, Vec<CategoryItem>> = BTreeMap::new();
    for (category_id, item) in collect_rows(rows).context("failed to load category items")? {
        items.entry(category_id).or_default().push(item);
    }
    for category in categories {
        category.items = items.remove(&category.id).unwrap_or_default();
    }
    Ok(())
}

fn insert_item(conn: &Connection, category_id: &str, item: &CategoryItem) -> Result<()> {
    conn.execute(
        "INSERT INTO category_items(category_id, item_id, item_type) VALUES (?1, ?2, ?3)",
        params![category_id, item.item_id, item.item_type.as_str()],
    )
    .map_err(|err| {
        write_error(err, || {
            format!(
                "{} '{}' in category '{category_id}'",
                item.item_type.as_str(),
                item.item_id
            )
        })
    })
    .with_context(|| format!("failed to add item to category '{category_id}'"))?;
    Ok(())
}

fn touch(conn: &Connection, category_id: &str) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE categories SET update_at = ?1 WHERE id = ?2 AND delete_at = 0",
            params![now_millis(), category_id],
        )
        .with_context(|| format!("failed to touch category '{category_id}'"))?;
    if updated == 0 {
        return Err(not_found(format!("category '{category_id}'")));
    }
    Ok(())
}

impl CategoryStore for SqliteStore {
    fn create_category(&self, category: &Category) -> Result<Category> {
        if !category.id.is_empty() {
            return Err(invalid_argument(format!(
                "new category must not carry an id, got '{}'",
                category.id
            )));
        }
        if category.team_id.is_empty() || category.user_id.is_empty() {
            return Err(invalid_argument(
                "category must belong to a team and a user".to_string(),
            ));
        }
        let mut stored = category.clone();
        stored.id = new_id();
        stored.create_at = now_millis();
        stored.update_at = stored.create_at;
        stored.delete_at = 0;
        stored.items.sort();
        stored.items.dedup();

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("failed to start category transaction")?;
        tx.execute(
            "INSERT INTO categories(id, name, team_id, user_id, collapsed, create_at, update_at, delete_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                stored.id,
                stored.name,
                stored.team_id,
                stored.user_id,
                bool_to_sql(stored.collapsed),
                stored.create_at,
                stored.update_at,
            ],
        )
        .with_context(|| format!("failed to insert category '{}'", stored.name))?;
        for item in &stored.items {
            insert_item(&tx, &stored.id, item)?;
        }
        tx.commit().context("failed to commit category transaction")?;
        Ok(stored)
    }

    fn get_category(&self, id: &str) -> Result<Category> {
        let conn = self.conn()?;
        let category = conn
            .query_row(
                &format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE id = ?1"),
                params![id],
                map_category_row,
            )
            .optional()
            .with_context(|| format!("failed to get category '{id}'"))?
            .ok_or_else(|| not_found(format!("category '{id}'")))?;
        let mut categories = vec![category];
        attach_items(&conn, &mut categories)?;
        categories
            .pop()
            .ok_or_else(|| not_found(format!("category '{id}'")))
    }

    fn get_categories(&self, team_id: &str, user_id: &str) -> Result<Vec<Category>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CATEGORY_COLUMNS} FROM categories
             WHERE team_id = ?1 AND user_id = ?2 AND delete_at = 0
             ORDER BY name ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![team_id, user_id], map_category_row)?;
        let mut categories = collect_rows(rows)
            .with_context(|| format!("failed to list categories for '{user_id}' in '{team_id}'"))?;
        attach_items(&conn, &mut categories)?;
        Ok(categories)
    }

    fn update_category(&self, category: &Category) -> Result<()> {
        let mut items = category.items.clone();
        items.sort();
        items.dedup();

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("failed to start category transaction")?;
        let updated = tx
            .execute(
                "UPDATE categories SET name = ?1, collapsed = ?2, update_at = ?3
                 WHERE id = ?4 AND delete_at = 0",
                params![
                    category.name,
                    bool_to_sql(category.collapsed),
                    now_millis(),
                    category.id
                ],
            )
            .with_context(|| format!("failed to update category '{}'", category.id))?;
        if updated == 0 {
            return Err(not_found(format!("category '{}'", category.id)));
        }
        tx.execute(
            "DELETE FROM category_items WHERE category_id = ?1",
            params![category.id],
        )
        .with_context(|| format!("failed to clear items of category '{}'", category.id))?;
        for item in &items {
            insert_item(&tx, &category.id, item)?;
        }
        tx.commit().context("failed to commit category transaction")?;
        Ok(())
    }

    fn delete_category(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE categories SET delete_at = ?1 WHERE id = ?2 AND delete_at = 0",
                params![now_millis(), id],
            )
            .with_context(|| format!("failed to delete category '{id}'"))?;
        if updated == 0 {
            return Err(not_found(format!("category '{id}'")));
        }
        Ok(())
    }

    fn add_category_item(&self, category_id: &str, item: &CategoryItem) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("failed to start category transaction")?;
        touch(&tx, category_id)?;
        insert_item(&tx, category_id, item)?;
        tx.commit().context("failed to commit category transaction")?;
        Ok(())
    }

    fn remove_category_item(&self, category_id: &str, item: &CategoryItem) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("failed to start category transaction")?;
        touch(&tx, category_id)?;
        let removed = tx
            .execute(
                "DELETE FROM category_items
                 WHERE category_id = ?1 AND item_id = ?2 AND item_type = ?3",
                params![category_id, item.item_id, item.item_type.as_str()],
            )
            .with_context(|| format!("failed to remove item from category '{category_id}'"))?;
        if removed == 0 {
            return Err(not_found(format!(
                "{} '{}' in category '{category_id}'",
                item.item_type.as_str(),
                item.item_id
            )));
        }
        tx.commit().context("failed to commit category transaction")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture_store, must};
    use runbook_core::{classify, ErrorClass};

    fn category(name: &str) -> Category {
        Category {
            name: name.to_string(),
            team_id: "t1".to_string(),
            user_id: "alice".to_string(),
            ..Category::default()
        }
    }

    fn playbook_item(id: &str) -> CategoryItem {
        CategoryItem {
            item_id: id.to_string(),
            item_type: CategoryItemType::Playbook,
        }
    }

    #[test]
    fn listing_is_ordered_by_name_and_skips_deleted() {
        let store = fixture_store();
        let zulu = must(store.create_category(&category("Zulu")));
        must(store.create_category(&category("alpha")));
        let doomed = must(store.create_category(&category("Bravo")));
        must(store.delete_category(&doomed.id));

        let names: Vec<String> = must(store.get_categories("t1", "alice"))
            .into_iter()
            .map(|category| category.name)
            .collect();
        assert_eq!(names, vec!["Zulu".to_string(), "alpha".to_string()]);
        assert!(must(store.get_categories("t1", "bob")).is_empty());
        assert_eq!(must(store.get_category(&zulu.id)).name, "Zulu");
    }

    #[test]
    fn items_are_unique_per_category() {
        let store = fixture_store();
        let favorites = must(store.create_category(&category("Favorites")));
        must(store.add_category_item(&favorites.id, &playbook_item("pb1")));
        must(store.add_category_item(
            &favorites.id,
            &CategoryItem {
                item_id: "pb1".to_string(),
                item_type: CategoryItemType::Run,
            },
        ));

        let err = match store.add_category_item(&favorites.id, &playbook_item("pb1")) {
            Ok(()) => panic!("duplicate item should be rejected"),
            Err(err) => err,
        };
        assert_eq!(classify(&err), ErrorClass::DataIntegrity);
        assert_eq!(must(store.get_category(&favorites.id)).items.len(), 2);

        must(store.remove_category_item(&favorites.id, &playbook_item("pb1")));
        let remaining = must(store.get_category(&favorites.id)).items;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].item_type, CategoryItemType::Run);
    }

    #[test]
    fn update_rewrites_name_collapse_and_items() {
        let store = fixture_store();
        let mut stored = must(store.create_category(&category("Oncall")));
        stored.name = "On-call".to_string();
        stored.collapsed = true;
        stored.items = vec![playbook_item("b"), playbook_item("a"), playbook_item("a")];
        must(store.update_category(&stored));

        let fetched = must(store.get_category(&stored.id));
        assert_eq!(fetched.name, "On-call");
        assert!(fetched.collapsed);
        assert_eq!(fetched.items, vec![playbook_item("a"), playbook_item("b")]);
        assert!(fetched.update_at >= fetched.create_at);
    }

    #[test]
    fn operations_on_missing_category_are_not_found() {
        let store = fixture_store();
        let err = match store.add_category_item("missing", &playbook_item("pb1")) {
            Ok(()) => panic!("expected not found"),
            Err(err) => err,
        };
        assert_eq!(classify(&err), ErrorClass::NotFound);
        assert!(store.delete_category("missing").is_err());
    }
}
