use sea_orm_migration::prelude::*;

use super::m20250301_000001_create_catalog::{Categories, Products};

#[derive(DeriveMigrationName)]
pub struct Migration;

const CATEGORIES: &[(&str, &str)] = &[
    ("Beverages", "Soft drinks, coffees, teas"),
    ("Dairy", "Cheeses and milk"),
    ("Produce", "Dried fruit and bean curd"),
];

/// `(name, price, in_stock, category id)`; ids follow `CATEGORIES` order from 1.
const PRODUCTS: &[(&str, f64, bool, i32)] = &[
    ("Chai", 18.0, true, 1),
    ("Chang", 19.0, false, 1),
    ("Ipoh Coffee", 46.0, true, 1),
    ("Mozzarella", 34.8, true, 2),
    ("Gorgonzola", 12.5, true, 2),
    ("Tofu", 23.25, true, 3),
    ("Dried Apples", 53.0, false, 3),
];

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let mut categories = Query::insert();
        categories
            .into_table(Categories::Table)
            .columns([Categories::Id, Categories::Name, Categories::Description]);
        for (id, (name, description)) in (1_i32..).zip(CATEGORIES) {
            categories
                .values([id.into(), (*name).into(), (*description).into()])
                .map_err(|e| DbErr::Migration(e.to_string()))?;
        }
        manager.exec_stmt(categories).await?;

        let mut products = Query::insert();
        products.into_table(Products::Table).columns([
            Products::Name,
            Products::Price,
            Products::InStock,
            Products::CategoryId,
        ]);
        for &(name, price, in_stock, category_id) in PRODUCTS {
            products
                .values([name.into(), price.into(), in_stock.into(), category_id.into()])
                .map_err(|e| DbErr::Migration(e.to_string()))?;
        }
        manager.exec_stmt(products).await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .exec_stmt(Query::delete().from_table(Products::Table).to_owned())
            .await?;
        manager
            .exec_stmt(Query::delete().from_table(Categories::Table).to_owned())
            .await
    }
}
