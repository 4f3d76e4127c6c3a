//! Database schema definitions using sea-query.

use sea_query::Iden;

/// Users table schema.
#[derive(Iden)]
pub enum Users {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "name"]
    Name,
    #[iden = "age"]
    Age,
    #[iden = "gender"]
    Gender,
    #[iden = "city"]
    City,
    #[iden = "interests"]
    Interests,
    #[iden = "photo"]
    Photo,
    #[iden = "preferred_gender"]
    PreferredGender,
    #[iden = "preferred_age_min"]
    PreferredAgeMin,
    #[iden = "preferred_age_max"]
    PreferredAgeMax,
    #[iden = "preferred_city"]
    PreferredCity,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// SQL for creating the users table.
pub const CREATE_USERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    age INTEGER NOT NULL CHECK (age >= 0),
    gender TEXT NOT NULL CHECK (gender IN ('male', 'female', 'other')),
    city TEXT NOT NULL,
    interests TEXT NOT NULL DEFAULT '',
    photo TEXT,
    preferred_gender TEXT CHECK (preferred_gender IN ('male', 'female', 'other')),
    preferred_age_min INTEGER,
    preferred_age_max INTEGER,
    preferred_city TEXT,
    updated_at TEXT NOT NULL
);
"#;
