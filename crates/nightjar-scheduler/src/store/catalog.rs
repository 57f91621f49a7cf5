//! Templates, schedules and job groups.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use super::{
    JOB_COLUMNS, SqliteStore, format_ts, get_json, get_opt_run_status, get_opt_ts, get_ts,
    is_constraint_violation, job_from_row, new_id,
};
use crate::SchedulerError;
use crate::types::{
    GroupStatus, Job, JobGroup, JobParams, JobStatus, JobTemplate, MemberState, NewTemplate,
    RetryPolicy, Schedule, TemplateUpdate,
};

const TEMPLATE_COLUMNS: &str = "template_id, name, job_type, default_params, retry_policy, \
     description, created_at, updated_at";

const SCHEDULE_COLUMNS: &str =
    "schedule_id, template_id, name, trigger_spec, enabled, last_fired_at, created_at";

fn template_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobTemplate> {
    Ok(JobTemplate {
        template_id: row.get(0)?,
        name: row.get(1)?,
        job_type: row.get(2)?,
        default_params: get_json::<JobParams>(row, 3)?,
        retry_policy: get_json::<RetryPolicy>(row, 4)?,
        description: row.get(5)?,
        created_at: get_ts(row, 6)?,
        updated_at: get_ts(row, 7)?,
    })
}

fn schedule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Schedule> {
    Ok(Schedule {
        schedule_id: row.get(0)?,
        template_id: row.get(1)?,
        name: row.get(2)?,
        trigger: get_json::<serde_json::Value>(row, 3)?,
        enabled: row.get(4)?,
        last_fired_at: get_opt_ts(row, 5)?,
        created_at: get_ts(row, 6)?,
    })
}

fn load_template(
    conn: &Connection,
    template_id: &str,
) -> Result<Option<JobTemplate>, SchedulerError> {
    let template = conn
        .query_row(
            &format!("SELECT {TEMPLATE_COLUMNS} FROM job_templates WHERE template_id = ?1"),
            params![template_id],
            template_from_row,
        )
        .optional()?;
    Ok(template)
}

fn load_schedule(conn: &Connection, schedule_id: &str) -> Result<Option<Schedule>, SchedulerError> {
    let schedule = conn
        .query_row(
            &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE schedule_id = ?1"),
            params![schedule_id],
            schedule_from_row,
        )
        .optional()?;
    Ok(schedule)
}

fn duplicate_name(err: rusqlite::Error, name: &str) -> SchedulerError {
    if is_constraint_violation(&err) {
        SchedulerError::InvalidOperation(format!("a template named {name} already exists"))
    } else {
        err.into()
    }
}

/// Derive a group's status from its members' job and run rows.
fn derive_group_status(conn: &Connection, group_id: &str) -> Result<GroupStatus, SchedulerError> {
    let mut stmt = conn.prepare(
        "SELECT jobs.status, jobs.finished_at IS NOT NULL, job_runs.status
         FROM jobs LEFT JOIN job_runs ON job_runs.job_id = jobs.job_id
         WHERE jobs.group_id = ?1",
    )?;
    let members = stmt
        .query_map(params![group_id], |row| {
            let status: String = row.get(0)?;
            let finished: bool = row.get(1)?;
            let run_status = get_opt_run_status(row, 2)?;
            Ok((status, finished, run_status))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let members = members
        .into_iter()
        .map(|(status, finished, run_status)| {
            let status = JobStatus::parse(&status).ok_or_else(|| {
                SchedulerError::Storage(format!("unknown job status in group {group_id}: {status}"))
            })?;
            Ok(MemberState::from_parts(status, finished, run_status))
        })
        .collect::<Result<Vec<_>, SchedulerError>>()?;

    Ok(GroupStatus::derive(&members))
}

impl SqliteStore {
    // =========================================================================
    // Templates
    // =========================================================================

    pub fn create_template(&self, new: &NewTemplate) -> Result<JobTemplate, SchedulerError> {
        let now = Utc::now();
        let template = JobTemplate {
            template_id: new_id(),
            name: new.name.clone(),
            job_type: new.job_type.clone(),
            default_params: new.default_params.clone(),
            retry_policy: new.retry_policy,
            description: new.description.clone(),
            created_at: now,
            updated_at: now,
        };

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO job_templates
             (template_id, name, job_type, default_params, retry_policy, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                template.template_id,
                template.name,
                template.job_type,
                serde_json::to_string(&template.default_params)?,
                serde_json::to_string(&template.retry_policy)?,
                template.description,
                format_ts(&template.created_at),
                format_ts(&template.updated_at),
            ],
        )
        .map_err(|e| duplicate_name(e, &template.name))?;
        Ok(template)
    }

    pub fn get_template(&self, template_id: &str) -> Result<JobTemplate, SchedulerError> {
        let conn = self.conn()?;
        load_template(&conn, template_id)?
            .ok_or_else(|| SchedulerError::TemplateNotFound(template_id.to_string()))
    }

    pub fn get_template_by_name(&self, name: &str) -> Result<Option<JobTemplate>, SchedulerError> {
        let conn = self.conn()?;
        let template = conn
            .query_row(
                &format!("SELECT {TEMPLATE_COLUMNS} FROM job_templates WHERE name = ?1"),
                params![name],
                template_from_row,
            )
            .optional()?;
        Ok(template)
    }

    pub fn list_templates(&self) -> Result<Vec<JobTemplate>, SchedulerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM job_templates ORDER BY name ASC"
        ))?;
        let templates = stmt
            .query_map([], template_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(templates)
    }

    pub fn update_template(
        &self,
        template_id: &str,
        update: &TemplateUpdate,
    ) -> Result<JobTemplate, SchedulerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = load_template(&tx, template_id)?
            .ok_or_else(|| SchedulerError::TemplateNotFound(template_id.to_string()))?;
        let name = update.name.clone().unwrap_or(current.name);
        let job_type = update.job_type.clone().unwrap_or(current.job_type);
        let default_params = update
            .default_params
            .clone()
            .unwrap_or(current.default_params);
        let retry_policy = update.retry_policy.unwrap_or(current.retry_policy);
        let description = update.description.clone().or(current.description);

        tx.execute(
            "UPDATE job_templates
             SET name = ?2, job_type = ?3, default_params = ?4, retry_policy = ?5,
                 description = ?6, updated_at = ?7
             WHERE template_id = ?1",
            params![
                template_id,
                name,
                job_type,
                serde_json::to_string(&default_params)?,
                serde_json::to_string(&retry_policy)?,
                description,
                format_ts(&Utc::now()),
            ],
        )
        .map_err(|e| duplicate_name(e, &name))?;

        let template = load_template(&tx, template_id)?
            .ok_or_else(|| SchedulerError::TemplateNotFound(template_id.to_string()))?;
        tx.commit()?;
        Ok(template)
    }

    /// Delete a template. Its schedules go with it; jobs keep running
    /// without a template reference.
    pub fn delete_template(&self, template_id: &str) -> Result<(), SchedulerError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM job_templates WHERE template_id = ?1",
            params![template_id],
        )?;
        if deleted == 0 {
            return Err(SchedulerError::TemplateNotFound(template_id.to_string()));
        }
        Ok(())
    }

    // =========================================================================
    // Schedules
    // =========================================================================

    pub fn create_schedule(
        &self,
        template_id: &str,
        name: &str,
        trigger: &serde_json::Value,
    ) -> Result<Schedule, SchedulerError> {
        let conn = self.conn()?;
        if load_template(&conn, template_id)?.is_none() {
            return Err(SchedulerError::TemplateNotFound(template_id.to_string()));
        }

        let schedule = Schedule {
            schedule_id: new_id(),
            template_id: template_id.to_string(),
            name: name.to_string(),
            trigger: trigger.clone(),
            enabled: true,
            last_fired_at: None,
            created_at: Utc::now(),
        };
        conn.execute(
            "INSERT INTO schedules
             (schedule_id, template_id, name, trigger_spec, enabled, last_fired_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)",
            params![
                schedule.schedule_id,
                schedule.template_id,
                schedule.name,
                serde_json::to_string(&schedule.trigger)?,
                schedule.enabled,
                format_ts(&schedule.created_at),
            ],
        )?;
        Ok(schedule)
    }

    pub fn get_schedule(&self, schedule_id: &str) -> Result<Schedule, SchedulerError> {
        let conn = self.conn()?;
        load_schedule(&conn, schedule_id)?
            .ok_or_else(|| SchedulerError::ScheduleNotFound(schedule_id.to_string()))
    }

    pub fn list_schedules(&self) -> Result<Vec<Schedule>, SchedulerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at ASC"
        ))?;
        let schedules = stmt
            .query_map([], schedule_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(schedules)
    }

    pub fn set_schedule_enabled(
        &self,
        schedule_id: &str,
        enabled: bool,
    ) -> Result<Schedule, SchedulerError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE schedules SET enabled = ?2 WHERE schedule_id = ?1",
            params![schedule_id, enabled],
        )?;
        if changed == 0 {
            return Err(SchedulerError::ScheduleNotFound(schedule_id.to_string()));
        }
        load_schedule(&conn, schedule_id)?
            .ok_or_else(|| SchedulerError::ScheduleNotFound(schedule_id.to_string()))
    }

    pub fn record_schedule_fired(
        &self,
        schedule_id: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE schedules SET last_fired_at = ?2 WHERE schedule_id = ?1",
            params![schedule_id, format_ts(&fired_at)],
        )?;
        if changed == 0 {
            return Err(SchedulerError::ScheduleNotFound(schedule_id.to_string()));
        }
        Ok(())
    }

    pub fn delete_schedule(&self, schedule_id: &str) -> Result<(), SchedulerError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM schedules WHERE schedule_id = ?1",
            params![schedule_id],
        )?;
        if deleted == 0 {
            return Err(SchedulerError::ScheduleNotFound(schedule_id.to_string()));
        }
        Ok(())
    }

    // =========================================================================
    // Groups
    // =========================================================================

    pub fn create_group(&self, name: &str) -> Result<JobGroup, SchedulerError> {
        let group = JobGroup {
            group_id: new_id(),
            name: name.to_string(),
            created_at: Utc::now(),
            status: GroupStatus::Created,
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO job_groups (group_id, name, created_at) VALUES (?1, ?2, ?3)",
            params![group.group_id, group.name, format_ts(&group.created_at)],
        )?;
        Ok(group)
    }

    /// Get a group with its status derived from the members right now.
    pub fn get_group(&self, group_id: &str) -> Result<JobGroup, SchedulerError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT group_id, name, created_at FROM job_groups WHERE group_id = ?1",
                params![group_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, get_ts(row, 2)?)),
            )
            .optional()?;
        let (group_id, name, created_at) =
            row.ok_or_else(|| SchedulerError::GroupNotFound(group_id.to_string()))?;
        let status = derive_group_status(&conn, &group_id)?;
        Ok(JobGroup {
            group_id,
            name,
            created_at,
            status,
        })
    }

    pub fn get_group_status(&self, group_id: &str) -> Result<GroupStatus, SchedulerError> {
        Ok(self.get_group(group_id)?.status)
    }

    /// Members of a group in sequence order.
    pub fn list_group_jobs(&self, group_id: &str) -> Result<Vec<Job>, SchedulerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE jobs.group_id = ?1
             ORDER BY jobs.sequence_number ASC, jobs.created_at ASC"
        ))?;
        let jobs = stmt
            .query_map(params![group_id], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Groups whose derived status is not terminal.
    pub fn list_active_groups(&self) -> Result<Vec<JobGroup>, SchedulerError> {
        let group_ids: Vec<String> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare("SELECT group_id FROM job_groups ORDER BY created_at ASC")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let mut active = Vec::new();
        for group_id in group_ids {
            let group = self.get_group(&group_id)?;
            if !group.status.is_terminal() {
                active.push(group);
            }
        }
        Ok(active)
    }
}
