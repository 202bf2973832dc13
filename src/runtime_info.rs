//! Typed views over raw management responses.

use crate::management::{keys, ManagementResponse, ManagementValue};
use crate::ClientError;
use std::time::SystemTime;

/// Runtime information about a whole event hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubRuntimeInformation {
    pub path: String,
    pub created_at: SystemTime,
    pub partition_count: u32,
    pub partition_ids: Vec<String>,
}

/// Runtime information about one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRuntimeInformation {
    pub hub_path: String,
    pub partition_id: String,
    pub begin_sequence_number: i64,
    pub last_enqueued_sequence_number: i64,
    pub last_enqueued_offset: String,
    pub last_enqueued_time_utc: SystemTime,
}

fn field<'a>(response: &'a ManagementResponse, key: &str) -> Result<&'a ManagementValue, ClientError> {
    response
        .get(key)
        .ok_or_else(|| ClientError::MalformedResponse(format!("missing field {key:?}")))
}

fn wrong_type(key: &str, expected: &str) -> ClientError {
    ClientError::MalformedResponse(format!("field {key:?} is not {expected}"))
}

fn string(response: &ManagementResponse, key: &str) -> Result<String, ClientError> {
    field(response, key)?.as_str().map(str::to_string).ok_or_else(|| wrong_type(key, "a string"))
}

fn long(response: &ManagementResponse, key: &str) -> Result<i64, ClientError> {
    field(response, key)?.as_i64().ok_or_else(|| wrong_type(key, "an integer"))
}

fn timestamp(response: &ManagementResponse, key: &str) -> Result<SystemTime, ClientError> {
    field(response, key)?.as_timestamp().ok_or_else(|| wrong_type(key, "a timestamp"))
}

impl TryFrom<&ManagementResponse> for HubRuntimeInformation {
    type Error = ClientError;

    fn try_from(response: &ManagementResponse) -> Result<Self, Self::Error> {
        let count = long(response, keys::PARTITION_COUNT)?;
        let partition_count = u32::try_from(count)
            .map_err(|_| ClientError::MalformedResponse(format!("partition count {count} out of range")))?;
        let partition_ids = field(response, keys::PARTITION_IDS)?
            .as_string_list()
            .map(<[String]>::to_vec)
            .ok_or_else(|| wrong_type(keys::PARTITION_IDS, "a string list"))?;
        Ok(Self {
            path: string(response, keys::ENTITY_NAME)?,
            created_at: timestamp(response, keys::CREATED_AT)?,
            partition_count,
            partition_ids,
        })
    }
}

impl TryFrom<&ManagementResponse> for PartitionRuntimeInformation {
    type Error = ClientError;

    fn try_from(response: &ManagementResponse) -> Result<Self, Self::Error> {
        Ok(Self {
            hub_path: string(response, keys::ENTITY_NAME)?,
            partition_id: string(response, keys::PARTITION_NAME)?,
            begin_sequence_number: long(response, keys::BEGIN_SEQUENCE_NUMBER)?,
            last_enqueued_sequence_number: long(response, keys::LAST_ENQUEUED_SEQUENCE_NUMBER)?,
            last_enqueued_offset: string(response, keys::LAST_ENQUEUED_OFFSET)?,
            last_enqueued_time_utc: timestamp(response, keys::LAST_ENQUEUED_TIME_UTC)?,
        })
    }
}
