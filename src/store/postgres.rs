use anyhow::Context;
use serde_json::{Map, Value as JsonValue};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Postgres, Row, Transaction};

use crate::error::{StoreError, StoreResult};
use crate::model::{
    Attribute, Datatype, EntityRecord, EntityRef, EnumGroup, EnumValue, Fact, Id, NewAttribute,
    NewValue, Value, ValueData,
};
use crate::store::traits::{
    AttributeStore, EavTransaction, EntityStore, EnumStore, Store, TransactionalStore, ValueStore,
};

const ATTRIBUTE_COLUMNS: &str = "id, name, slug, datatype, enum_group_id, created, modified";

const VALUE_COLUMNS: &str = "id, attribute_id, entity_ct, entity_id, value_text, value_int, \
     value_float, value_date, value_bool, value_enum_id";

const FACT_SELECT: &str = r#"
    SELECT v.id, v.attribute_id, v.entity_ct, v.entity_id,
           v.value_text, v.value_int, v.value_float, v.value_date, v.value_bool, v.value_enum_id,
           a.name AS attr_name, a.slug AS attr_slug, a.datatype AS attr_datatype,
           a.enum_group_id AS attr_enum_group_id, a.created AS attr_created,
           a.modified AS attr_modified,
           ev.value AS enum_literal
    FROM eav_value v
    JOIN eav_attribute a ON a.id = v.attribute_id
    LEFT JOIN eav_enumvalue ev ON ev.id = v.value_enum_id
"#;

const ENTITY_COLUMNS: &str = "id, content_type, fields, created, modified";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Run the embedded database migrations
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        log::info!("Database migrations applied");
        Ok(())
    }

    /// Move the enum value id sequence past `floor` and any existing row.
    /// Never moves it backwards. Returns the last id handed out afterwards.
    pub async fn advance_enum_value_sequence(&self, floor: i64) -> StoreResult<i64> {
        let last: i64 = sqlx::query_scalar(
            r#"
            SELECT setval(
                pg_get_serial_sequence('eav_enumvalue', 'id'),
                GREATEST(
                    $1,
                    (SELECT COALESCE(MAX(id), 0) FROM eav_enumvalue),
                    (SELECT COALESCE(s.last_value, 0) FROM pg_sequences s
                     WHERE format('%I.%I', s.schemaname, s.sequencename)::regclass
                         = pg_get_serial_sequence('eav_enumvalue', 'id')::regclass)
                ),
                true
            )
            "#,
        )
        .bind(floor)
        .fetch_one(&self.pool)
        .await?;
        Ok(last)
    }

    async fn enum_group_values(&self, group_id: Id) -> StoreResult<Vec<EnumValue>> {
        let rows = sqlx::query(
            r#"
            SELECT v.id, v.value
            FROM eav_enumvalue v
            JOIN eav_enumgroup_values m ON m.enumvalue_id = v.id
            WHERE m.enumgroup_id = $1
            ORDER BY v.id
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(enum_value_from_row).collect()
    }
}

fn parse_datatype(raw: &str) -> StoreResult<Datatype> {
    raw.parse::<Datatype>().map_err(StoreError::Corrupt)
}

fn attribute_from_row(row: &PgRow) -> StoreResult<Attribute> {
    let datatype: String = row.try_get("datatype")?;
    Ok(Attribute {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        datatype: parse_datatype(&datatype)?,
        enum_group_id: row.try_get("enum_group_id")?,
        created: row.try_get("created")?,
        modified: row.try_get("modified")?,
    })
}

fn enum_value_from_row(row: &PgRow) -> StoreResult<EnumValue> {
    Ok(EnumValue {
        id: row.try_get("id")?,
        value: row.try_get("value")?,
    })
}

/// The first populated typed column, if any.
fn value_data_from_row(row: &PgRow) -> StoreResult<Option<ValueData>> {
    if let Some(text) = row.try_get::<Option<String>, _>("value_text")? {
        return Ok(Some(ValueData::Text(text)));
    }
    if let Some(int) = row.try_get::<Option<i64>, _>("value_int")? {
        return Ok(Some(ValueData::Int(int)));
    }
    if let Some(float) = row.try_get::<Option<f64>, _>("value_float")? {
        return Ok(Some(ValueData::Float(float)));
    }
    if let Some(date) = row.try_get::<Option<chrono::NaiveDate>, _>("value_date")? {
        return Ok(Some(ValueData::Date(date)));
    }
    if let Some(flag) = row.try_get::<Option<bool>, _>("value_bool")? {
        return Ok(Some(ValueData::Bool(flag)));
    }
    Ok(row
        .try_get::<Option<Id>, _>("value_enum_id")?
        .map(ValueData::Enum))
}

fn value_from_row(row: &PgRow) -> StoreResult<Value> {
    Ok(Value {
        id: row.try_get("id")?,
        attribute_id: row.try_get("attribute_id")?,
        entity: EntityRef {
            content_type: row.try_get("entity_ct")?,
            id: row.try_get("entity_id")?,
        },
        data: value_data_from_row(row)?,
    })
}

fn fact_from_row(row: &PgRow) -> StoreResult<Fact> {
    let datatype: String = row.try_get("attr_datatype")?;
    let value = value_from_row(row)?;
    Ok(Fact {
        attribute: Attribute {
            id: value.attribute_id,
            name: row.try_get("attr_name")?,
            slug: row.try_get("attr_slug")?,
            datatype: parse_datatype(&datatype)?,
            enum_group_id: row.try_get("attr_enum_group_id")?,
            created: row.try_get("attr_created")?,
            modified: row.try_get("attr_modified")?,
        },
        value,
        enum_literal: row.try_get("enum_literal")?,
    })
}

fn entity_from_row(row: &PgRow) -> StoreResult<EntityRecord> {
    let fields: JsonValue = row.try_get("fields")?;
    let JsonValue::Object(fields) = fields else {
        return Err(StoreError::Corrupt(
            "eav_entity.fields is not a JSON object".to_string(),
        ));
    };
    Ok(EntityRecord {
        id: row.try_get("id")?,
        content_type: row.try_get("content_type")?,
        fields,
        created: row.try_get("created")?,
        modified: row.try_get("modified")?,
    })
}

/// Typed column binds in table order: text, int, float, date, bool, enum.
struct ValueColumns {
    text: Option<String>,
    int: Option<i64>,
    float: Option<f64>,
    date: Option<chrono::NaiveDate>,
    flag: Option<bool>,
    enum_id: Option<Id>,
}

impl From<&ValueData> for ValueColumns {
    fn from(data: &ValueData) -> Self {
        let mut columns = ValueColumns {
            text: None,
            int: None,
            float: None,
            date: None,
            flag: None,
            enum_id: None,
        };
        match data {
            ValueData::Text(text) => columns.text = Some(text.clone()),
            ValueData::Int(int) => columns.int = Some(*int),
            ValueData::Float(float) => columns.float = Some(*float),
            ValueData::Date(date) => columns.date = Some(*date),
            ValueData::Bool(flag) => columns.flag = Some(*flag),
            ValueData::Enum(id) => columns.enum_id = Some(*id),
        }
        columns
    }
}

#[async_trait::async_trait]
impl AttributeStore for PostgresStore {
    async fn get_attribute(&self, id: Id) -> StoreResult<Option<Attribute>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM eav_attribute WHERE id = $1",
            ATTRIBUTE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(attribute_from_row).transpose()
    }

    async fn get_attribute_by_slug(&self, slug: &str) -> StoreResult<Option<Attribute>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM eav_attribute WHERE slug = $1",
            ATTRIBUTE_COLUMNS
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(attribute_from_row).transpose()
    }

    async fn list_attributes(&self) -> StoreResult<Vec<Attribute>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM eav_attribute ORDER BY id",
            ATTRIBUTE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(attribute_from_row).collect()
    }

    async fn delete_attribute(&self, id: Id) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM eav_attribute WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl EnumStore for PostgresStore {
    async fn get_enum_group(&self, id: Id) -> StoreResult<Option<EnumGroup>> {
        let row = sqlx::query("SELECT id, name FROM eav_enumgroup WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(EnumGroup {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            values: self.enum_group_values(id).await?,
        }))
    }

    async fn list_enum_groups(&self) -> StoreResult<Vec<EnumGroup>> {
        let rows = sqlx::query("SELECT id, name FROM eav_enumgroup ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut groups = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Id = row.try_get("id")?;
            groups.push(EnumGroup {
                id,
                name: row.try_get("name")?,
                values: self.enum_group_values(id).await?,
            });
        }

        Ok(groups)
    }

    async fn delete_enum_group(&self, id: Id) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM eav_enumgroup WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_enum_value(&self, id: Id) -> StoreResult<Option<EnumValue>> {
        let row = sqlx::query("SELECT id, value FROM eav_enumvalue WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(enum_value_from_row).transpose()
    }

    async fn list_enum_values(&self) -> StoreResult<Vec<EnumValue>> {
        let rows = sqlx::query("SELECT id, value FROM eav_enumvalue ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(enum_value_from_row).collect()
    }

    async fn delete_enum_value(&self, id: Id) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM eav_enumvalue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl ValueStore for PostgresStore {
    async fn list_facts(&self, entity: &EntityRef) -> StoreResult<Vec<Fact>> {
        let rows = sqlx::query(&format!(
            "{} WHERE v.entity_ct = $1 AND v.entity_id = $2 ORDER BY a.slug",
            FACT_SELECT
        ))
        .bind(&entity.content_type)
        .bind(entity.id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(fact_from_row).collect()
    }

    async fn list_facts_for_content_type(&self, content_type: &str) -> StoreResult<Vec<Fact>> {
        let rows = sqlx::query(&format!(
            "{} WHERE v.entity_ct = $1 ORDER BY v.entity_id, a.slug",
            FACT_SELECT
        ))
        .bind(content_type)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(fact_from_row).collect()
    }

    async fn count_values_for_attribute(&self, attribute_id: Id) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM eav_value WHERE attribute_id = $1")
            .bind(attribute_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

#[async_trait::async_trait]
impl EntityStore for PostgresStore {
    async fn get_entity(&self, content_type: &str, id: Id) -> StoreResult<Option<EntityRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM eav_entity WHERE content_type = $1 AND id = $2",
            ENTITY_COLUMNS
        ))
        .bind(content_type)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(entity_from_row).transpose()
    }

    async fn list_entities(&self, content_type: &str) -> StoreResult<Vec<EntityRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM eav_entity WHERE content_type = $1 ORDER BY id",
            ENTITY_COLUMNS
        ))
        .bind(content_type)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entity_from_row).collect()
    }
}

#[async_trait::async_trait]
impl TransactionalStore for PostgresStore {
    async fn begin(&self) -> StoreResult<Box<dyn EavTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx }))
    }
}

impl Store for PostgresStore {}

/// Unit of work on one pooled connection. sqlx rolls back on drop.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl EavTransaction for PostgresTransaction {
    async fn find_attribute(&mut self, id: Id) -> StoreResult<Option<Attribute>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM eav_attribute WHERE id = $1",
            ATTRIBUTE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(attribute_from_row).transpose()
    }

    async fn find_attribute_by_slug(&mut self, slug: &str) -> StoreResult<Option<Attribute>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM eav_attribute WHERE slug = $1",
            ATTRIBUTE_COLUMNS
        ))
        .bind(slug)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(attribute_from_row).transpose()
    }

    async fn get_or_create_attribute(
        &mut self,
        attribute: &NewAttribute,
    ) -> StoreResult<(Attribute, bool)> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO eav_attribute (name, slug, datatype, enum_group_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT ON CONSTRAINT eav_attribute_slug_key DO NOTHING
            RETURNING {}
            "#,
            ATTRIBUTE_COLUMNS
        ))
        .bind(&attribute.name)
        .bind(&attribute.slug)
        .bind(attribute.datatype.as_str())
        .bind(attribute.enum_group_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        if let Some(row) = inserted {
            return Ok((attribute_from_row(&row)?, true));
        }

        let existing = self
            .find_attribute_by_slug(&attribute.slug)
            .await?
            .ok_or_else(|| StoreError::not_found("attribute", &attribute.slug))?;
        Ok((existing, false))
    }

    async fn rename_attribute(&mut self, id: Id, name: &str) -> StoreResult<Option<Attribute>> {
        let row = sqlx::query(&format!(
            "UPDATE eav_attribute SET name = $2, modified = NOW() WHERE id = $1 RETURNING {}",
            ATTRIBUTE_COLUMNS
        ))
        .bind(id)
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(attribute_from_row).transpose()
    }

    async fn get_or_create_enum_group(&mut self, name: &str) -> StoreResult<(Id, bool)> {
        let inserted: Option<Id> = sqlx::query_scalar(
            r#"
            INSERT INTO eav_enumgroup (name) VALUES ($1)
            ON CONFLICT ON CONSTRAINT eav_enumgroup_name_key DO NOTHING
            RETURNING id
            "#,
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;

        if let Some(id) = inserted {
            return Ok((id, true));
        }

        let id: Id = sqlx::query_scalar("SELECT id FROM eav_enumgroup WHERE name = $1")
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| StoreError::not_found("enum group", name))?;
        Ok((id, false))
    }

    async fn lock_enum_group(&mut self, id: Id) -> StoreResult<bool> {
        let locked: Option<Id> =
            sqlx::query_scalar("SELECT id FROM eav_enumgroup WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?;

        Ok(locked.is_some())
    }

    async fn rename_enum_group(&mut self, id: Id, name: &str) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE eav_enumgroup SET name = $2 WHERE id = $1")
            .bind(id)
            .bind(name)
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_group_member(
        &mut self,
        group_id: Id,
        literal: &str,
    ) -> StoreResult<Option<EnumValue>> {
        let row = sqlx::query(
            r#"
            SELECT v.id, v.value
            FROM eav_enumvalue v
            JOIN eav_enumgroup_values m ON m.enumvalue_id = v.id
            WHERE m.enumgroup_id = $1 AND v.value = $2
            ORDER BY v.id
            LIMIT 1
            "#,
        )
        .bind(group_id)
        .bind(literal)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(enum_value_from_row).transpose()
    }

    async fn insert_enum_value(&mut self, literal: &str) -> StoreResult<EnumValue> {
        let row = sqlx::query("INSERT INTO eav_enumvalue (value) VALUES ($1) RETURNING id, value")
            .bind(literal)
            .fetch_one(&mut *self.tx)
            .await?;

        enum_value_from_row(&row)
    }

    async fn update_enum_value(&mut self, id: Id, literal: &str) -> StoreResult<Option<EnumValue>> {
        let row =
            sqlx::query("UPDATE eav_enumvalue SET value = $2 WHERE id = $1 RETURNING id, value")
                .bind(id)
                .bind(literal)
                .fetch_optional(&mut *self.tx)
                .await?;

        row.as_ref().map(enum_value_from_row).transpose()
    }

    async fn enum_value_groups(&mut self, value_id: Id) -> StoreResult<Vec<Id>> {
        let groups = sqlx::query_scalar(
            r#"
            SELECT enumgroup_id FROM eav_enumgroup_values
            WHERE enumvalue_id = $1
            ORDER BY enumgroup_id
            "#,
        )
        .bind(value_id)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(groups)
    }

    async fn add_group_member(&mut self, group_id: Id, value_id: Id) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO eav_enumgroup_values (enumgroup_id, enumvalue_id) VALUES ($1, $2)
            ON CONFLICT ON CONSTRAINT eav_enumgroup_values_membership_key DO NOTHING
            "#,
        )
        .bind(group_id)
        .bind(value_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn upsert_value(&mut self, value: &NewValue) -> StoreResult<(Value, bool)> {
        let columns = ValueColumns::from(&value.data);
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO eav_value (attribute_id, entity_ct, entity_id, value_text, value_int,
                                   value_float, value_date, value_bool, value_enum_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT ON CONSTRAINT eav_value_fact_key DO UPDATE SET
                value_text = EXCLUDED.value_text,
                value_int = EXCLUDED.value_int,
                value_float = EXCLUDED.value_float,
                value_date = EXCLUDED.value_date,
                value_bool = EXCLUDED.value_bool,
                value_enum_id = EXCLUDED.value_enum_id,
                modified = NOW()
            RETURNING {}, (xmax = 0) AS inserted
            "#,
            VALUE_COLUMNS
        ))
        .bind(value.attribute_id)
        .bind(&value.entity.content_type)
        .bind(value.entity.id)
        .bind(columns.text)
        .bind(columns.int)
        .bind(columns.float)
        .bind(columns.date)
        .bind(columns.flag)
        .bind(columns.enum_id)
        .fetch_one(&mut *self.tx)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        Ok((value_from_row(&row)?, inserted))
    }

    async fn delete_values_for_entity(&mut self, entity: &EntityRef) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM eav_value WHERE entity_ct = $1 AND entity_id = $2")
            .bind(&entity.content_type)
            .bind(entity.id)
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected())
    }

    async fn insert_entity(
        &mut self,
        content_type: &str,
        fields: &Map<String, JsonValue>,
    ) -> StoreResult<EntityRecord> {
        let row = sqlx::query(&format!(
            "INSERT INTO eav_entity (content_type, fields) VALUES ($1, $2) RETURNING {}",
            ENTITY_COLUMNS
        ))
        .bind(content_type)
        .bind(JsonValue::Object(fields.clone()))
        .fetch_one(&mut *self.tx)
        .await?;

        entity_from_row(&row)
    }

    async fn lock_entity(&mut self, content_type: &str, id: Id) -> StoreResult<Option<EntityRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM eav_entity WHERE content_type = $1 AND id = $2 FOR UPDATE",
            ENTITY_COLUMNS
        ))
        .bind(content_type)
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(entity_from_row).transpose()
    }

    async fn update_entity_fields(
        &mut self,
        content_type: &str,
        id: Id,
        fields: &Map<String, JsonValue>,
    ) -> StoreResult<Option<EntityRecord>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE eav_entity SET fields = $3, modified = NOW()
            WHERE content_type = $1 AND id = $2
            RETURNING {}
            "#,
            ENTITY_COLUMNS
        ))
        .bind(content_type)
        .bind(id)
        .bind(JsonValue::Object(fields.clone()))
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(entity_from_row).transpose()
    }

    async fn delete_entity(&mut self, content_type: &str, id: Id) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM eav_entity WHERE content_type = $1 AND id = $2")
            .bind(content_type)
            .bind(id)
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
