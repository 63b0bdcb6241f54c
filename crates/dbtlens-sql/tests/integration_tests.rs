//! Integration tests for column lineage resolution

use dbtlens_core::{ColumnReference, ReferenceType, SqlDialect};
use dbtlens_sql::{resolve_column_lineage, DbtFunctionExtractor, LineageResolver, SqlParser};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;

fn lineage(sql: &str) -> Vec<ColumnReference> {
    let parser = SqlParser::from_dialect(SqlDialect::DuckDb);
    let parsed = parser.parse(sql, None).unwrap();
    resolve_column_lineage(parsed.as_query())
}

/// column -> table for every external reference
fn external(references: &[ColumnReference]) -> BTreeMap<String, String> {
    references
        .iter()
        .filter(|r| r.reference_type == ReferenceType::External)
        .filter_map(|r| Some((r.column_name.clone(), r.table_reference.clone()?)))
        .collect()
}

fn expected(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(c, t)| (c.to_string(), t.to_string())).collect()
}

fn find<'a>(references: &'a [ColumnReference], column: &str) -> &'a ColumnReference {
    references
        .iter()
        .find(|r| r.column_name == column)
        .unwrap_or_else(|| panic!("no reference for {column}"))
}

#[test]
fn simple_select_no_joins() {
    let refs = lineage("SELECT customer_id, name, email FROM customers");

    assert_eq!(
        external(&refs),
        expected(&[("customer_id", "customers"), ("name", "customers"), ("email", "customers")])
    );
    assert!(refs.iter().all(|r| r.resolved.is_none()));
}

#[test]
fn join_with_aliases() {
    let refs = lineage(
        r#"
        SELECT c.id, o.total
        FROM customers c
        LEFT JOIN orders o ON c.id = o.customer_id
        "#,
    );

    assert_eq!(
        refs,
        vec![
            ColumnReference::external("id", "customers"),
            ColumnReference::external("total", "orders"),
        ]
    );
}

#[test]
fn dbt_encoded_references() {
    let refs = lineage(
        r#"
        SELECT
            "___source___inventory__products___"."id" AS "product_id",
            "cat"."name" AS "category_name",
            "cat"."department" AS "department"
        FROM "___source___inventory__products___" AS "___source___inventory__products___"
        LEFT JOIN "___source___inventory__categories___" AS "cat"
            ON "___source___inventory__products___"."category_id" = "cat"."id"
        "#,
    );

    assert_eq!(
        external(&refs),
        expected(&[
            ("id", "inventory__products"),
            ("name", "inventory__categories"),
            ("department", "inventory__categories"),
        ])
    );
}

#[test]
fn function_expressions_collect_every_leaf() {
    let refs = lineage(
        r#"
        SELECT
            md5(
                CAST(p.id AS VARCHAR) || CAST(cat.department AS VARCHAR) || CAST(cat.name AS VARCHAR)
            ) AS product_guid,
            cat.name AS category_name
        FROM ___source___inventory__products___ AS p
        LEFT JOIN ___source___inventory__categories___ AS cat ON p.category_id = cat.id
        "#,
    );

    assert_eq!(
        external(&refs),
        expected(&[
            ("id", "inventory__products"),
            ("name", "inventory__categories"),
            ("department", "inventory__categories"),
        ])
    );
    // first occurrence wins, in expression order
    let names: Vec<&str> = refs.iter().map(|r| r.column_name.as_str()).collect();
    assert_eq!(names, vec!["id", "department", "name"]);
}

#[test]
fn multiple_joins() {
    let refs = lineage(
        r#"
        SELECT c.customer_id, o.order_id, p.product_name, s.store_name
        FROM customers c
        LEFT JOIN orders o ON c.customer_id = o.customer_id
        LEFT JOIN products p ON o.product_id = p.product_id
        LEFT JOIN stores s ON o.store_id = s.store_id
        "#,
    );

    assert_eq!(
        external(&refs),
        expected(&[
            ("customer_id", "customers"),
            ("order_id", "orders"),
            ("product_name", "products"),
            ("store_name", "stores"),
        ])
    );
}

#[test]
fn self_join_keeps_first_occurrence() {
    let refs = lineage(
        r#"
        SELECT mgr.name AS manager_name, emp.name AS employee_name
        FROM employees mgr
        LEFT JOIN employees emp ON mgr.employee_id = emp.manager_id
        "#,
    );

    assert_eq!(refs, vec![ColumnReference::external("name", "employees")]);
}

#[test]
fn unqualified_column_in_join_is_ambiguous() {
    let refs = lineage(
        r#"
        SELECT customer_id, c.name, o.order_total
        FROM customers c
        LEFT JOIN orders o ON c.customer_id = o.customer_id
        "#,
    );

    assert_eq!(find(&refs, "customer_id"), &ColumnReference::unattributed("customer_id"));
    assert_eq!(
        external(&refs),
        expected(&[("name", "customers"), ("order_total", "orders")])
    );
}

#[test]
fn empty_input() {
    assert!(resolve_column_lineage(None).is_empty());
}

#[test]
fn select_star_contributes_nothing() {
    let refs = lineage(
        "SELECT * FROM customers c LEFT JOIN orders o ON c.customer_id = o.customer_id",
    );
    assert!(refs.is_empty());

    let refs = lineage("SELECT c.*, o.id FROM customers c JOIN orders o ON c.id = o.customer_id");
    assert_eq!(refs, vec![ColumnReference::external("id", "orders")]);
}

#[test]
fn subquery_in_from() {
    let refs = lineage(
        r#"
        SELECT sub.customer_id, sub.order_count, c.name
        FROM (
            SELECT customer_id, COUNT(*) AS order_count
            FROM orders
            GROUP BY customer_id
        ) sub
        LEFT JOIN customers c ON sub.customer_id = c.customer_id
        "#,
    );

    assert_eq!(
        refs,
        vec![
            ColumnReference::external("customer_id", "orders"),
            ColumnReference::subquery("order_count", "sub"),
            ColumnReference::external("name", "customers"),
        ]
    );
}

#[test]
fn cte_columns_surface_through_nested_scopes() {
    let refs = lineage(
        r#"
        WITH my_cte AS (SELECT a, b FROM tbl)
        SELECT c, d FROM my_cte
        "#,
    );

    assert_eq!(external(&refs), expected(&[("a", "tbl"), ("b", "tbl")]));
    assert_eq!(find(&refs, "c"), &ColumnReference::cte("c", "my_cte", false));
    assert_eq!(find(&refs, "d"), &ColumnReference::cte("d", "my_cte", false));
}

#[test]
fn invalid_cte_reference() {
    let refs = lineage(
        r#"
        WITH my_cte AS (SELECT a, b FROM tbl)
        SELECT c, b FROM my_cte
        "#,
    );

    assert_eq!(
        refs,
        vec![
            ColumnReference::cte("c", "my_cte", false),
            ColumnReference::external("b", "tbl"),
            ColumnReference::external("a", "tbl"),
        ]
    );
}

#[test]
fn missing_cte_column_alongside_traced_source() {
    let refs = lineage("WITH cte AS (SELECT a FROM t) SELECT b FROM cte");

    assert_eq!(
        refs,
        vec![
            ColumnReference::cte("b", "cte", false),
            ColumnReference::external("a", "t"),
        ]
    );
}

#[test]
fn renamed_cte_column_does_not_hide_invalid_reference() {
    let refs = lineage("WITH c AS (SELECT id AS order_id FROM orders) SELECT order_id, id FROM c");

    assert_eq!(
        refs,
        vec![
            ColumnReference::external("order_id", "orders"),
            ColumnReference::cte("id", "c", false),
        ]
    );
}

#[test]
fn scalar_subquery_with_cte() {
    let refs = lineage(
        r#"
        SELECT
            order_ref,
            (
                WITH my_cte AS (SELECT customer FROM tbl)
                SELECT renamed FROM my_cte
            ) AS final_name,
            more_data
        FROM tbl
        "#,
    );

    assert_eq!(
        external(&refs),
        expected(&[("order_ref", "tbl"), ("customer", "tbl"), ("more_data", "tbl")])
    );
    // the scope reading my_cte is skipped, so `renamed` never appears
    assert!(refs.iter().all(|r| r.column_name != "renamed"));
}

#[test]
fn detailed_reference_kinds() {
    let refs = lineage(
        r#"
        SELECT
            sub.customer_id,
            sub.order_count,
            c.name,
            (
                WITH my_cte AS (SELECT customer FROM tbl)
                SELECT customer FROM my_cte
            ) AS cte_customer
        FROM (
            SELECT customer_id, COUNT(*) AS order_count
            FROM orders
            GROUP BY customer_id
        ) sub
        LEFT JOIN customers c ON sub.customer_id = c.customer_id
        "#,
    );

    assert_eq!(find(&refs, "customer_id"), &ColumnReference::external("customer_id", "orders"));
    assert_eq!(find(&refs, "order_count"), &ColumnReference::subquery("order_count", "sub"));
    assert_eq!(find(&refs, "name"), &ColumnReference::external("name", "customers"));
    assert_eq!(find(&refs, "customer"), &ColumnReference::external("customer", "tbl"));
}

#[test]
fn rendered_dbt_model() {
    let sql = r#"
        WITH orders AS (
            SELECT id, customer_id, amount FROM {{ ref('stg_orders') }}
        ),
        customers AS (
            SELECT id, name FROM {{ source('raw', 'customers') }}
        )
        SELECT
            o.id AS order_id,
            c.name AS customer_name,
            SUM(o.amount) AS lifetime_value
        FROM orders o
        JOIN customers c ON c.id = o.customer_id
        GROUP BY 1, 2
    "#;

    let rendered = DbtFunctionExtractor::render(sql);
    let refs = lineage(&rendered);

    assert_eq!(
        refs,
        vec![
            ColumnReference::external("id", "stg_orders"),
            ColumnReference::external("name", "raw__customers"),
            ColumnReference::external("amount", "stg_orders"),
            ColumnReference::external("customer_id", "stg_orders"),
        ]
    );
}

#[test]
fn nested_derived_tables_trace_transitively() {
    let refs = lineage(
        r#"
        SELECT outer_q.id
        FROM (
            SELECT inner_q.id FROM (SELECT id FROM accounts) AS inner_q
        ) AS outer_q
        "#,
    );

    assert_eq!(refs, vec![ColumnReference::external("id", "accounts")]);
}

#[test]
fn resolution_is_idempotent() {
    let parser = SqlParser::from_dialect(SqlDialect::DuckDb);
    let parsed = parser
        .parse(
            "WITH x AS (SELECT a, b + c AS d FROM t) SELECT x.a, x.d, u.e FROM x JOIN u ON x.a = u.a",
            None,
        )
        .unwrap();
    let query = parsed.as_query().unwrap();

    let first = LineageResolver::new(query).resolve();
    let second = LineageResolver::new(query).resolve();
    assert_eq!(first, second);
    assert_eq!(find(&first, "d"), &ColumnReference::cte("d", "x", true));
}

#[test]
fn union_branches() {
    let refs = lineage("SELECT id FROM a UNION ALL SELECT id FROM b UNION ALL SELECT other FROM c");

    assert_eq!(
        refs,
        vec![
            ColumnReference::external("id", "a"),
            ColumnReference::external("other", "c"),
        ]
    );
}
