//! SQLite document store for service templates and services
//!
//! Each record is stored as a JSON body next to a few indexed columns.
//! Ids are SQLite rowids.

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use crate::models::{Service, ServiceTemplate};
use crate::Result;

/// Database for state storage
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Create in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS service_templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS services (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                template_id INTEGER NOT NULL,
                state TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_services_state ON services(state);
            "#,
        )?;
        Ok(())
    }

    // ===== Service templates =====

    /// Store a new template; assigns and returns its id
    pub fn insert_template(&self, t: &mut ServiceTemplate) -> Result<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO service_templates (name, body, created_at) VALUES (?1, '{}', ?2)",
            params![t.name, t.registration_time.to_rfc3339()],
        )?;
        t.id = tx.last_insert_rowid() as u64;
        tx.execute(
            "UPDATE service_templates SET body = ?1 WHERE id = ?2",
            params![serde_json::to_string(t)?, t.id as i64],
        )?;
        tx.commit()?;
        Ok(t.id)
    }

    pub fn get_template(&self, id: u64) -> Result<Option<ServiceTemplate>> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM service_templates WHERE id = ?1",
                params![id as i64],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(Into::into))
            .transpose()
    }

    pub fn list_templates(&self) -> Result<Vec<ServiceTemplate>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT body FROM service_templates ORDER BY id")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(Into::into))
            .collect()
    }

    pub fn delete_template(&self, id: u64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM service_templates WHERE id = ?1", params![id as i64])?;
        Ok(rows > 0)
    }

    // ===== Services =====

    /// Store a new service; assigns and returns its id
    pub fn insert_service(&self, s: &mut Service) -> Result<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO services (name, template_id, state, body, updated_at) VALUES (?1, ?2, ?3, '{}', ?4)",
            params![s.name, s.template_id as i64, s.state.to_string(), Utc::now().to_rfc3339()],
        )?;
        s.id = tx.last_insert_rowid() as u64;
        tx.execute(
            "UPDATE services SET body = ?1 WHERE id = ?2",
            params![serde_json::to_string(s)?, s.id as i64],
        )?;
        tx.commit()?;
        Ok(s.id)
    }

    /// Overwrite the stored snapshot of a service
    pub fn update_service(&self, s: &Service) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE services SET name = ?1, state = ?2, body = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                s.name,
                s.state.to_string(),
                serde_json::to_string(s)?,
                Utc::now().to_rfc3339(),
                s.id as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_service(&self, id: u64) -> Result<Option<Service>> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM services WHERE id = ?1",
                params![id as i64],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(Into::into))
            .transpose()
    }

    pub fn list_services(&self) -> Result<Vec<Service>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT body FROM services ORDER BY id")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(Into::into))
            .collect()
    }

    /// Number of services referencing a template that are not DONE
    pub fn count_active_services_for_template(&self, template_id: u64) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM services WHERE template_id = ?1 AND state != 'DONE'",
            params![template_id as i64],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn delete_service(&self, id: u64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM services WHERE id = ?1", params![id as i64])?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RoleDefinition, ServiceState};

    fn template() -> ServiceTemplate {
        ServiceTemplate::new("web-app", "oneadmin").with_role(RoleDefinition::new("web", 0, 2))
    }

    #[test]
    fn test_template_crud() {
        let db = Database::in_memory().unwrap();
        let mut t = template();
        let id = db.insert_template(&mut t).unwrap();
        assert_eq!(t.id, id);

        let loaded = db.get_template(id).unwrap().unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.roles.len(), 1);
        assert_eq!(db.list_templates().unwrap().len(), 1);

        assert!(db.delete_template(id).unwrap());
        assert!(db.get_template(id).unwrap().is_none());
        assert!(!db.delete_template(id).unwrap());
    }

    #[test]
    fn test_service_insert_and_update() {
        let db = Database::in_memory().unwrap();
        let mut s = Service::new(0, "app", "oneadmin", 7);
        let id = db.insert_service(&mut s).unwrap();
        assert_eq!(s.id, id);
        assert_eq!(db.count_active_services_for_template(7).unwrap(), 1);

        s.transition(ServiceState::Deploying, "deploying");
        db.update_service(&s).unwrap();
        let loaded = db.get_service(id).unwrap().unwrap();
        assert_eq!(loaded.state, ServiceState::Deploying);
        assert_eq!(loaded.log.len(), 2);

        s.state = ServiceState::Done;
        db.update_service(&s).unwrap();
        assert_eq!(db.count_active_services_for_template(7).unwrap(), 0);

        assert!(db.delete_service(id).unwrap());
        assert!(db.list_services().unwrap().is_empty());
    }

    #[test]
    fn test_failed_insert_leaves_no_row() {
        let db = Database::in_memory().unwrap();
        db.conn
            .lock()
            .execute_batch(
                "CREATE TRIGGER reject_body BEFORE UPDATE ON services
                 BEGIN SELECT RAISE(ABORT, 'body rejected'); END;",
            )
            .unwrap();

        let mut s = Service::new(0, "app", "oneadmin", 7);
        assert!(db.insert_service(&mut s).is_err());
        assert!(db.list_services().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("flow.db");
        let id = {
            let db = Database::open(&path).unwrap();
            db.insert_template(&mut template()).unwrap()
        };
        let db = Database::open(&path).unwrap();
        assert_eq!(db.get_template(id).unwrap().unwrap().name, "web-app");
    }
}
