#![cfg(feature = "sqlite")]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use odata_core::{ODataLimits, parse_query};
use odata_db::{
    BodyMode, ConnectOpts, DbHandle, EntityRegistry, EntityType, FieldKind, Navigation, Property,
    Related, RepoError, Repository, SqlQuery, body_to_values, translate,
};
use sea_orm::ConnectionTrait;
use serde_json::json;

const SCHEMA: &str = r"
CREATE TABLE categories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE products (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    price REAL,
    in_stock BOOLEAN NOT NULL DEFAULT 1,
    category_id INTEGER REFERENCES categories(id)
);
INSERT INTO categories (name) VALUES ('Beverages'), ('Dairy'), ('Empty');
INSERT INTO products (name, price, in_stock, category_id) VALUES
    ('Chai', 18.0, 1, 1),
    ('Chang', 19.0, 0, 1),
    ('Milk', 1.5, 1, 2),
    ('Cheese', 7.25, 1, 2),
    ('Mystery', NULL, 1, NULL);
";

fn registry() -> EntityRegistry {
    let mut reg = EntityRegistry::new();
    reg.register(
        EntityType::builder("Category")
            .set_name("Categories")
            .table("categories")
            .key("Id")
            .property(Property::new("Id", FieldKind::I64).column("id").computed())
            .property(Property::new("Name", FieldKind::String).column("name"))
            .navigation(Navigation::one_to_many("Products", "Product", "CategoryId"))
            .build()
            .unwrap(),
    )
    .unwrap();
    reg.register(
        EntityType::builder("Product")
            .set_name("Products")
            .table("products")
            .key("Id")
            .property(Property::new("Id", FieldKind::I64).column("id").computed())
            .property(Property::new("Name", FieldKind::String).column("name"))
            .property(Property::new("Price", FieldKind::F64).column("price").nullable())
            .property(Property::new("InStock", FieldKind::Bool).column("in_stock"))
            .property(
                Property::new("CategoryId", FieldKind::I64)
                    .column("category_id")
                    .nullable(),
            )
            .navigation(Navigation::many_to_one("Category", "Category", "CategoryId"))
            .build()
            .unwrap(),
    )
    .unwrap();
    reg.validate().unwrap();
    reg
}

async fn setup() -> (DbHandle, Repository, EntityRegistry) {
    let opts = ConnectOpts {
        max_conns: Some(1),
        ..ConnectOpts::default()
    };
    let db = DbHandle::connect("sqlite::memory:", opts).await.unwrap();
    db.conn().execute_unprepared(SCHEMA).await.unwrap();
    let repo = Repository::for_engine(db.engine());
    (db, repo, registry())
}

fn sql_query(entity: &EntityType, qs: &str) -> SqlQuery {
    let q = parse_query(qs, &ODataLimits::default()).unwrap();
    translate(entity, &q).unwrap()
}

#[tokio::test]
async fn filter_order_and_paging() {
    let (db, repo, reg) = setup().await;
    let products = reg.by_set("Products").unwrap();

    let q = sql_query(
        &products,
        "$filter=InStock%20eq%20true%20and%20Price%20gt%205&$orderby=Price%20desc&$top=2&$count=true",
    );
    let found = repo.find(db.conn(), &products, &q).await.unwrap();

    let names: Vec<_> = found.rows.iter().map(|r| r["Name"].clone()).collect();
    assert_eq!(names, vec![json!("Chai"), json!("Cheese")]);
    assert_eq!(found.count, Some(2));
}

#[tokio::test]
async fn select_keeps_the_key() {
    let (db, repo, reg) = setup().await;
    let products = reg.by_set("Products").unwrap();

    let q = sql_query(&products, "$select=Name&$filter=startswith(Name,%27Ch%27)");
    let found = repo.find(db.conn(), &products, &q).await.unwrap();

    assert_eq!(found.rows.len(), 3);
    for row in &found.rows {
        assert_eq!(row.len(), 2, "{row:?}");
        assert!(row.contains_key("Id"));
        assert!(row.contains_key("Name"));
    }
    assert_eq!(found.count, None);
}

#[tokio::test]
async fn null_comparisons_and_skip_without_top() {
    let (db, repo, reg) = setup().await;
    let products = reg.by_set("Products").unwrap();

    let q = sql_query(&products, "$filter=Price%20eq%20null");
    let found = repo.find(db.conn(), &products, &q).await.unwrap();
    assert_eq!(found.rows.len(), 1);
    assert_eq!(found.rows[0]["Name"], json!("Mystery"));
    assert_eq!(found.rows[0]["Price"], serde_json::Value::Null);

    let q = sql_query(&products, "$skip=3");
    let found = repo.find(db.conn(), &products, &q).await.unwrap();
    assert_eq!(found.rows.len(), 2);
    assert_eq!(found.rows[0]["Id"], json!(4));
}

#[tokio::test]
async fn count_ignores_paging() {
    let (db, repo, reg) = setup().await;
    let products = reg.by_set("Products").unwrap();
    let q = sql_query(&products, "$filter=CategoryId%20eq%202&$top=1");
    assert_eq!(repo.count(db.conn(), &products, &q).await.unwrap(), 2);
}

#[tokio::test]
async fn insert_returns_computed_key_and_crud_round() {
    let (db, repo, reg) = setup().await;
    let products = reg.by_set("Products").unwrap();

    let body = json!({"Name": "Tofu", "Price": 23.25, "InStock": true, "CategoryId": 2});
    let values = body_to_values(&products, body.as_object().unwrap(), BodyMode::Create).unwrap();
    let created = repo.insert(db.conn(), &products, values).await.unwrap();
    assert_eq!(created["Id"], json!(6));
    assert_eq!(created["Name"], json!("Tofu"));

    let patch = json!({"Price": 25.0});
    let values = body_to_values(&products, patch.as_object().unwrap(), BodyMode::Merge).unwrap();
    let n = repo
        .update(db.conn(), &products, 6i64.into(), values)
        .await
        .unwrap();
    assert_eq!(n, 1);

    let row = repo
        .find_by_key(db.conn(), &products, 6i64.into(), &products.properties)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["Price"], json!(25.0));
    assert_eq!(row["InStock"], json!(true));

    assert_eq!(repo.delete(db.conn(), &products, 6i64.into()).await.unwrap(), 1);
    assert!(
        repo.find_by_key(db.conn(), &products, 6i64.into(), &products.properties)
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(repo.delete(db.conn(), &products, 6i64.into()).await.unwrap(), 0);
}

#[tokio::test]
async fn unique_violation_is_a_conflict() {
    let (db, repo, reg) = setup().await;
    let categories = reg.by_set("Categories").unwrap();
    let body = json!({"Name": "Dairy"});
    let values = body_to_values(&categories, body.as_object().unwrap(), BodyMode::Create).unwrap();
    let err = repo.insert(db.conn(), &categories, values).await.unwrap_err();
    assert!(matches!(err, RepoError::Conflict(_)), "{err:?}");
}

#[tokio::test]
async fn deleting_a_referenced_row_violates_foreign_key() {
    let (db, repo, reg) = setup().await;
    let categories = reg.by_set("Categories").unwrap();
    let err = repo
        .delete(db.conn(), &categories, 1i64.into())
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::ForeignKey(_)), "{err:?}");
}

#[tokio::test]
async fn navigation_in_both_directions() {
    let (db, repo, reg) = setup().await;
    let products = reg.by_set("Products").unwrap();
    let categories = reg.by_set("Categories").unwrap();

    let milk = repo
        .find_by_key(db.conn(), &products, 3i64.into(), &products.properties)
        .await
        .unwrap()
        .unwrap();
    let nav = reg
        .resolve(&products, products.navigation("Category").unwrap())
        .unwrap();
    let related = repo
        .find_related(db.conn(), &products, &nav, &milk, &SqlQuery::all(&categories))
        .await
        .unwrap();
    match related {
        Related::One(Some(cat)) => assert_eq!(cat["Name"], json!("Dairy")),
        other => panic!("unexpected {other:?}"),
    }

    let beverages = repo
        .find_by_key(db.conn(), &categories, 1i64.into(), &categories.properties)
        .await
        .unwrap()
        .unwrap();
    let nav = reg
        .resolve(&categories, categories.navigation("Products").unwrap())
        .unwrap();
    let q = sql_query(&products, "$filter=InStock%20eq%20true");
    let related = repo
        .find_related(db.conn(), &categories, &nav, &beverages, &q)
        .await
        .unwrap();
    let json = related.into_json();
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["Name"], json!("Chai"));
}

#[tokio::test]
async fn null_foreign_key_has_no_target() {
    let (db, repo, reg) = setup().await;
    let products = reg.by_set("Products").unwrap();
    let categories = reg.by_set("Categories").unwrap();
    let mystery = repo
        .find_by_key(db.conn(), &products, 5i64.into(), &products.properties)
        .await
        .unwrap()
        .unwrap();
    let nav = reg
        .resolve(&products, products.navigation("Category").unwrap())
        .unwrap();
    let related = repo
        .find_related(db.conn(), &products, &nav, &mystery, &SqlQuery::all(&categories))
        .await
        .unwrap();
    assert_eq!(related, Related::One(None));
}

#[tokio::test]
async fn transaction_rollback_discards_changes() {
    let (db, repo, reg) = setup().await;
    let categories = reg.by_set("Categories").unwrap();

    let tx = db.begin().await.unwrap();
    let body = json!({"Name": "Produce"});
    let values = body_to_values(&categories, body.as_object().unwrap(), BodyMode::Create).unwrap();
    repo.insert(tx.conn(), &categories, values).await.unwrap();
    tx.rollback().await.unwrap();

    let all = repo
        .find(db.conn(), &categories, &SqlQuery::all(&categories))
        .await
        .unwrap();
    assert_eq!(all.rows.len(), 3);
}
