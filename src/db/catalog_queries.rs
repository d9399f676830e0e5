use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use strsim::jaro_winkler;
use tracing::debug;
use uuid::Uuid;

use crate::models::wine::ExtractedWineData;
use crate::services::vector_search::IndexImageRequest;

/// Similarity floor for fuzzy varietal resolution ("Cab Sauv" vs "Cabernet Sauvignon" misses;
/// "Gewurztraminer" vs "Gewürztraminer" hits).
const VARIETAL_FUZZY_THRESHOLD: f64 = 0.88;

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Equal percentage split across a varietal set, rounded to 2 decimals.
/// Extraction carries no proportion data, so every varietal gets the same share.
pub fn split_percent(count: usize) -> f64 {
    (100.0 / count as f64 * 100.0).round() / 100.0
}

/// Find-or-create a region by case-insensitive (name, country).
///
/// The check-then-insert is an optimization; the unique index is the real
/// mutual exclusion. An insert losing the race re-queries and returns the
/// winner's row.
pub async fn find_or_create_region(
    pool: &PgPool,
    name: &str,
    country: &str,
) -> Result<Uuid, sqlx::Error> {
    if let Some(id) = find_region(pool, name, country).await? {
        return Ok(id);
    }

    let inserted = sqlx::query("INSERT INTO regions (name, country) VALUES ($1, $2) RETURNING id")
        .bind(name)
        .bind(country)
        .fetch_one(pool)
        .await;

    match inserted {
        Ok(row) => row.try_get("id"),
        Err(e) if is_unique_violation(&e) => {
            debug!(name, country, "Lost region insert race, re-querying");
            find_region(pool, name, country)
                .await?
                .ok_or(sqlx::Error::RowNotFound)
        }
        Err(e) => Err(e),
    }
}

async fn find_region(pool: &PgPool, name: &str, country: &str) -> Result<Option<Uuid>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id FROM regions WHERE LOWER(name) = LOWER($1) AND LOWER(country) = LOWER($2)",
    )
    .bind(name)
    .bind(country)
    .fetch_optional(pool)
    .await?;
    row.map(|r| r.try_get("id")).transpose()
}

/// Find-or-create a producer by case-insensitive name.
///
/// On a hit, location fields the catalog does not have yet are patched in
/// from the extraction; populated fields are never overwritten.
pub async fn find_or_create_producer(
    pool: &PgPool,
    data: &ExtractedWineData,
    region_id: Option<Uuid>,
) -> Result<Uuid, sqlx::Error> {
    if let Some(id) = find_producer(pool, &data.producer).await? {
        patch_producer_fields(pool, id, data, region_id).await?;
        return Ok(id);
    }

    let inserted = sqlx::query(
        r#"
        INSERT INTO producers
            (name, website, address, city, postal_code, latitude, longitude, region_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id
        "#,
    )
    .bind(&data.producer)
    .bind(&data.producer_website)
    .bind(&data.producer_address)
    .bind(&data.producer_city)
    .bind(&data.producer_postal_code)
    .bind(data.latitude)
    .bind(data.longitude)
    .bind(region_id)
    .fetch_one(pool)
    .await;

    match inserted {
        Ok(row) => row.try_get("id"),
        Err(e) if is_unique_violation(&e) => {
            debug!(producer = %data.producer, "Lost producer insert race, re-querying");
            let id = find_producer(pool, &data.producer)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?;
            patch_producer_fields(pool, id, data, region_id).await?;
            Ok(id)
        }
        Err(e) => Err(e),
    }
}

async fn find_producer(pool: &PgPool, name: &str) -> Result<Option<Uuid>, sqlx::Error> {
    let row = sqlx::query("SELECT id FROM producers WHERE LOWER(name) = LOWER($1)")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    row.map(|r| r.try_get("id")).transpose()
}

/// Fill null producer fields from a later, richer extraction. COALESCE keeps
/// whatever is already set.
async fn patch_producer_fields(
    pool: &PgPool,
    producer_id: Uuid,
    data: &ExtractedWineData,
    region_id: Option<Uuid>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE producers
        SET website = COALESCE(website, $1),
            address = COALESCE(address, $2),
            city = COALESCE(city, $3),
            postal_code = COALESCE(postal_code, $4),
            latitude = COALESCE(latitude, $5),
            longitude = COALESCE(longitude, $6),
            region_id = COALESCE(region_id, $7)
        WHERE id = $8
        "#,
    )
    .bind(&data.producer_website)
    .bind(&data.producer_address)
    .bind(&data.producer_city)
    .bind(&data.producer_postal_code)
    .bind(data.latitude)
    .bind(data.longitude)
    .bind(region_id)
    .bind(producer_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Find-or-create a wine by case-insensitive name within a producer.
/// Returns (id, created) so the caller knows whether to enqueue downstream
/// enrichment for a brand-new wine.
pub async fn find_or_create_wine(
    pool: &PgPool,
    producer_id: Uuid,
    name: &str,
    is_nv: bool,
) -> Result<(Uuid, bool), sqlx::Error> {
    if let Some(id) = find_wine(pool, producer_id, name).await? {
        return Ok((id, false));
    }

    let inserted = sqlx::query(
        "INSERT INTO wines (producer_id, name, is_nv) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(producer_id)
    .bind(name)
    .bind(is_nv)
    .fetch_one(pool)
    .await;

    match inserted {
        Ok(row) => Ok((row.try_get("id")?, true)),
        Err(e) if is_unique_violation(&e) => {
            debug!(wine = name, "Lost wine insert race, re-querying");
            let id = find_wine(pool, producer_id, name)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?;
            Ok((id, false))
        }
        Err(e) => Err(e),
    }
}

async fn find_wine(
    pool: &PgPool,
    producer_id: Uuid,
    name: &str,
) -> Result<Option<Uuid>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id FROM wines WHERE producer_id = $1 AND LOWER(name) = LOWER($2)",
    )
    .bind(producer_id)
    .bind(name)
    .fetch_optional(pool)
    .await?;
    row.map(|r| r.try_get("id")).transpose()
}

/// Get-or-create the vintage slot for (wine, year). A null year is the wine's
/// single NV slot (enforced by a unique index on COALESCE(year, 0)). ABV is
/// patched in when the existing row has none.
pub async fn get_or_create_vintage(
    pool: &PgPool,
    wine_id: Uuid,
    year: Option<i32>,
    abv: Option<f64>,
) -> Result<Uuid, sqlx::Error> {
    if let Some(id) = find_vintage(pool, wine_id, year).await? {
        if let Some(abv) = abv {
            sqlx::query("UPDATE vintages SET abv = COALESCE(abv, $1) WHERE id = $2")
                .bind(abv)
                .bind(id)
                .execute(pool)
                .await?;
        }
        return Ok(id);
    }

    let inserted = sqlx::query(
        "INSERT INTO vintages (wine_id, year, abv) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(wine_id)
    .bind(year)
    .bind(abv)
    .fetch_one(pool)
    .await;

    match inserted {
        Ok(row) => row.try_get("id"),
        Err(e) if is_unique_violation(&e) => {
            debug!(%wine_id, ?year, "Lost vintage insert race, re-querying");
            find_vintage(pool, wine_id, year)
                .await?
                .ok_or(sqlx::Error::RowNotFound)
        }
        Err(e) => Err(e),
    }
}

async fn find_vintage(
    pool: &PgPool,
    wine_id: Uuid,
    year: Option<i32>,
) -> Result<Option<Uuid>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id FROM vintages WHERE wine_id = $1 AND year IS NOT DISTINCT FROM $2",
    )
    .bind(wine_id)
    .bind(year)
    .fetch_optional(pool)
    .await?;
    row.map(|r| r.try_get("id")).transpose()
}

/// Resolve a varietal name: exact case-insensitive match, then fuzzy match
/// over the known set, then create.
pub async fn resolve_varietal(pool: &PgPool, name: &str) -> Result<Uuid, sqlx::Error> {
    let exact = sqlx::query("SELECT id FROM varietals WHERE LOWER(name) = LOWER($1)")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    if let Some(row) = exact {
        return row.try_get("id");
    }

    // The varietal table stays small; fuzzy-match in process over the full set.
    let candidates = sqlx::query("SELECT id, name FROM varietals")
        .fetch_all(pool)
        .await?;

    let needle = name.to_lowercase();
    let mut best: Option<(Uuid, f64)> = None;
    for row in &candidates {
        let candidate: String = row.try_get("name")?;
        let score = jaro_winkler(&needle, &candidate.to_lowercase());
        if score >= VARIETAL_FUZZY_THRESHOLD && best.map_or(true, |(_, s)| score > s) {
            best = Some((row.try_get("id")?, score));
        }
    }
    if let Some((id, score)) = best {
        debug!(varietal = name, score, "Fuzzy-matched varietal");
        return Ok(id);
    }

    let inserted = sqlx::query("INSERT INTO varietals (name) VALUES ($1) RETURNING id")
        .bind(name)
        .fetch_one(pool)
        .await;

    match inserted {
        Ok(row) => row.try_get("id"),
        Err(e) if is_unique_violation(&e) => {
            let row = sqlx::query("SELECT id FROM varietals WHERE LOWER(name) = LOWER($1)")
                .bind(name)
                .fetch_one(pool)
                .await?;
            row.try_get("id")
        }
        Err(e) => Err(e),
    }
}

/// Replace a vintage's varietal associations wholesale: delete everything,
/// insert the new set with an equal percentage split.
pub async fn replace_vintage_varietals(
    pool: &PgPool,
    vintage_id: Uuid,
    varietals: &[String],
) -> Result<(), sqlx::Error> {
    if varietals.is_empty() {
        return Ok(());
    }

    let mut ids = Vec::with_capacity(varietals.len());
    for name in varietals {
        ids.push(resolve_varietal(pool, name).await?);
    }
    ids.sort();
    ids.dedup();

    let percent = split_percent(ids.len());

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM vintage_varietals WHERE vintage_id = $1")
        .bind(vintage_id)
        .execute(&mut *tx)
        .await?;
    for varietal_id in &ids {
        sqlx::query(
            "INSERT INTO vintage_varietals (vintage_id, varietal_id, percent) VALUES ($1, $2, $3)",
        )
        .bind(vintage_id)
        .bind(varietal_id)
        .bind(percent)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

/// Create the tasting row for the submitting user. Verdict stays null for the
/// user to fill in later.
pub async fn create_tasting(
    pool: &PgPool,
    user_id: Uuid,
    vintage_id: Uuid,
    notes: &str,
    tasted_at: DateTime<Utc>,
    image_url: &str,
) -> Result<Uuid, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO tastings (user_id, vintage_id, notes, tasted_at, image_url)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(user_id)
    .bind(vintage_id)
    .bind(notes)
    .bind(tasted_at)
    .bind(image_url)
    .fetch_one(pool)
    .await?;
    row.try_get("id")
}

/// Queue a newly created wine for background knowledge enrichment. A
/// duplicate key means one is already queued; that is not an error.
pub async fn enqueue_wine_enrichment(pool: &PgPool, wine_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO wine_enrichment_queue (wine_id) VALUES ($1) ON CONFLICT (wine_id) DO NOTHING",
    )
    .bind(wine_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Queue embedding generation for a resolved scan so the visual index learns
/// this label. This is how the catalog becomes progressively matchable.
pub async fn enqueue_embedding(
    pool: &PgPool,
    request: &IndexImageRequest,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO embedding_queue (scan_id, image_url, wine_id, vintage_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (scan_id) DO NOTHING
        "#,
    )
    .bind(request.scan_id)
    .bind(&request.image_url)
    .bind(request.wine_id)
    .bind(request.vintage_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_split_is_even_and_rounded() {
        assert_eq!(split_percent(1), 100.0);
        assert_eq!(split_percent(2), 50.0);
        assert_eq!(split_percent(3), 33.33);
        assert_eq!(split_percent(4), 25.0);
        assert_eq!(split_percent(6), 16.67);
        assert_eq!(split_percent(7), 14.29);
    }
}
