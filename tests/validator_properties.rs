// Validator properties over a mixed corpus of benign and hostile queries

mod common;

use common::shop_policy;
use sqlgov::security::ast;
use sqlgov::security::{QueryValidator, UserContext, ValidationLevel, ValidatorPolicy};

const CORPUS: &[&str] = &[
    "SELECT customer_name, email FROM customers LIMIT 10",
    "SELECT region, COUNT(*) FROM customers GROUP BY region",
    "SELECT * FROM order_items",
    "SELECT * FROM customers, orders LIMIT 5",
    "SELECT c.customer_name, SUM(o.total_amount) FROM customers c JOIN orders o ON o.customer_id = c.id GROUP BY c.customer_name ORDER BY 2 DESC LIMIT 5",
    "SELECT * FROM customers WHERE id = 1 OR 1=1",
    "SELECT * FROM customers -- WHERE region = 'EU'",
    "SELECT * FROM customers; DROP TABLE customers;",
    "DELETE FROM orders WHERE id = 3",
    "UPDATE customers SET email = 'x'",
    "SELECT pg_read_file('/etc/passwd')",
    "SELECT table_name FROM information_schema.tables",
    "SELEC customer_name FROM customers",
    "WITH recent AS (SELECT * FROM orders WHERE order_date > '2024-01-01') SELECT COUNT(*) FROM recent",
    "SELECT id FROM orders WHERE total_amount > (SELECT AVG(total_amount) FROM orders) LIMIT 20",
];

fn validator() -> QueryValidator {
    QueryValidator::new(shop_policy())
}

fn users() -> Vec<UserContext> {
    vec![
        UserContext::default(),
        UserContext::default().with_region("EU"),
        UserContext::default().with_allowed_tables(["customers"]),
    ]
}

#[test]
fn test_valid_verdicts_sanitize_to_a_single_read_only_selection() {
    let validator = validator();
    for user in users() {
        for level in ValidationLevel::ALL {
            for sql in CORPUS {
                let verdict = validator.validate_sql(sql, &user, level);
                if verdict.is_valid {
                    assert!(
                        ast::is_single_read_only_selection(&verdict.sanitized_query),
                        "{} at {} sanitized to {:?}",
                        sql,
                        level,
                        verdict.sanitized_query
                    );
                }
            }
        }
    }
}

#[test]
fn test_validation_is_deterministic() {
    let validator = validator();
    let user = UserContext::default().with_region("EU");
    for level in ValidationLevel::ALL {
        for sql in CORPUS {
            let first = validator.validate_sql(sql, &user, level);
            let second = validator.validate_sql(sql, &user, level);
            assert_eq!(first, second, "{} at {}", sql, level);
        }
    }
}

#[test]
fn test_stricter_levels_block_a_superset() {
    let validator = validator();
    for user in users() {
        for sql in CORPUS {
            let verdicts: Vec<_> = ValidationLevel::ALL
                .iter()
                .map(|level| validator.validate_sql(sql, &user, *level))
                .collect();
            for pair in verdicts.windows(2) {
                let (stricter, looser) = (&pair[0], &pair[1]);
                assert!(stricter.level < looser.level);
                if !looser.is_valid {
                    assert!(!stricter.is_valid, "{}: {} passed but {} blocked", sql, stricter.level, looser.level);
                }
                for category in looser.blocking_categories() {
                    assert!(
                        stricter.blocking_categories().contains(&category),
                        "{}: {} blocks {} but {} does not",
                        sql,
                        looser.level,
                        category,
                        stricter.level
                    );
                }
            }
        }
    }
}

#[test]
fn test_destructive_statements_never_pass() {
    let validator = QueryValidator::new(ValidatorPolicy::default());
    let admin = UserContext::default().with_trust_tier(ValidationLevel::Administrative);
    for sql in [
        "DROP TABLE customers",
        "SELECT 1; DELETE FROM customers",
        "INSERT INTO customers (id) VALUES (1)",
        "TRUNCATE orders",
    ] {
        let verdict = validator.validate_sql(sql, &admin, ValidationLevel::Administrative);
        assert!(!verdict.is_valid, "{}", sql);
        assert!(verdict.is_threat_based(), "{}", sql);
    }
}
