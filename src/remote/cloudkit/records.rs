//! CloudKit record shapes and field decoding for the photos database.

use std::collections::HashMap;

use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::remote::{Asset, AssetKind, FieldError, GeoLocation};

pub(crate) const LIST_TYPE: &str = "CPLAssetAndMasterByAssetDateWithoutHiddenOrDeleted";

/// Fields requested in every listing query.
pub(crate) const DESIRED_KEYS: &[&str] = &[
    "recordName",
    "recordType",
    "recordChangeTag",
    "masterRef",
    "filenameEnc",
    "itemType",
    "resOriginalRes",
    "resOriginalWidth",
    "resOriginalHeight",
    "resOriginalFileType",
    "assetDate",
    "addedDate",
    "duration",
    "locationLatitude",
    "locationLongitude",
    "isDeleted",
    "isHidden",
];

/// Response from `/records/query` and `/records/modify`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    #[serde(default)]
    pub records: Vec<Value>,
}

pub(crate) fn encode_params(params: &HashMap<String, Value>) -> String {
    let mut pairs: Vec<String> = params
        .iter()
        .map(|(k, v)| {
            let val = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{}={}", urlencoding::encode(k), urlencoding::encode(&val))
        })
        .collect();
    pairs.sort();
    pairs.join("&")
}

/// Body of one listing page, newest first.
pub(crate) fn list_query(start_rank: u64, page_size: usize) -> Value {
    json!({
        "query": {
            "filterBy": [
                {
                    "fieldName": "startRank",
                    "fieldValue": {"type": "INT64", "value": start_rank},
                    "comparator": "EQUALS",
                },
                {
                    "fieldName": "direction",
                    "fieldValue": {"type": "STRING", "value": "DESCENDING"},
                    "comparator": "EQUALS",
                },
            ],
            "recordType": LIST_TYPE,
        },
        "resultsLimit": page_size * 2,
        "desiredKeys": DESIRED_KEYS,
        "zoneID": {"zoneName": "PrimarySync"},
    })
}

/// Body that soft-deletes one CPLAsset record.
pub(crate) fn delete_operation(record_name: &str, change_tag: Option<&str>) -> Value {
    json!({
        "operations": [{
            "operationType": "update",
            "record": {
                "recordName": record_name,
                "recordType": "CPLAsset",
                "recordChangeTag": change_tag,
                "fields": {"isDeleted": {"value": 1}},
            },
        }],
        "zoneID": {"zoneName": "PrimarySync"},
        "atomic": true,
    })
}

fn kind_from_item_type(s: &str) -> Option<AssetKind> {
    match s {
        "com.apple.quicktime-movie" | "public.mpeg-4" => Some(AssetKind::Video),
        s if s.starts_with("public.") || s.ends_with("raw-image") => Some(AssetKind::Image),
        _ => None,
    }
}

fn millis(v: &Value) -> Option<DateTime<Utc>> {
    v.as_f64()
        .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single())
}

/// One CPLMaster paired with its CPLAsset.
#[derive(Debug, Clone)]
pub struct PhotoRecord {
    master: Value,
    asset: Value,
}

/// The original resource of a photo.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub url: String,
    pub size: u64,
    pub checksum: Option<String>,
}

impl PhotoRecord {
    pub fn new(master: Value, asset: Value) -> Self {
        Self { master, asset }
    }

    /// Name of the CPLAsset record. Deletion targets this record.
    pub fn record_name(&self) -> Option<&str> {
        self.asset["recordName"].as_str()
    }

    pub fn change_tag(&self) -> Option<&str> {
        self.asset["recordChangeTag"].as_str()
    }

    fn field(&self, name: &str) -> &Value {
        let on_asset = &self.asset["fields"][name]["value"];
        if on_asset.is_null() {
            &self.master["fields"][name]["value"]
        } else {
            on_asset
        }
    }

    pub fn filename(&self) -> Result<String, FieldError> {
        let enc = &self.master["fields"]["filenameEnc"];
        let value = enc["value"]
            .as_str()
            .ok_or(FieldError::Missing("filenameEnc"))?;
        match enc["type"].as_str().unwrap_or("STRING") {
            "STRING" => Ok(value.to_string()),
            "ENCRYPTED_BYTES" => {
                let invalid = |reason: String| FieldError::Invalid {
                    field: "filenameEnc",
                    reason,
                };
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(value)
                    .map_err(|e| invalid(e.to_string()))?;
                String::from_utf8(bytes).map_err(|e| invalid(e.to_string()))
            }
            other => Err(FieldError::Invalid {
                field: "filenameEnc",
                reason: format!("unsupported type {other}"),
            }),
        }
    }

    pub fn original(&self) -> Result<Resource, FieldError> {
        let res = &self.master["fields"]["resOriginalRes"]["value"];
        if res.is_null() {
            return Err(FieldError::Missing("resOriginalRes"));
        }
        let url = res["downloadURL"]
            .as_str()
            .ok_or(FieldError::Missing("resOriginalRes.downloadURL"))?;
        Ok(Resource {
            url: url.to_string(),
            size: res["size"].as_u64().unwrap_or(0),
            checksum: res["fileChecksum"].as_str().map(str::to_string),
        })
    }

    pub fn describe(&self) -> Result<Asset, FieldError> {
        let filename = self.filename()?;
        let id = self
            .record_name()
            .ok_or(FieldError::Missing("recordName"))?
            .to_string();
        let size = self.master["fields"]["resOriginalRes"]["value"]["size"]
            .as_u64()
            .ok_or(FieldError::Missing("resOriginalRes.size"))?;

        let kind = self.master["fields"]["itemType"]["value"]
            .as_str()
            .and_then(kind_from_item_type)
            .or_else(|| AssetKind::from_filename(&filename))
            .unwrap_or(AssetKind::Image);

        let asset_date = millis(&self.asset["fields"]["assetDate"]["value"]);
        let added_date = millis(&self.asset["fields"]["addedDate"]["value"]);
        let created = millis(&self.master["created"]["timestamp"]).or(asset_date);

        let dimensions = match (
            self.field("resOriginalWidth").as_u64(),
            self.field("resOriginalHeight").as_u64(),
        ) {
            (Some(w), Some(h)) => Some((w as u32, h as u32)),
            _ => None,
        };

        let location = match (
            self.field("locationLatitude").as_f64(),
            self.field("locationLongitude").as_f64(),
        ) {
            (Some(latitude), Some(longitude)) => Some(GeoLocation {
                latitude,
                longitude,
            }),
            _ => None,
        };

        Ok(Asset {
            id,
            filename,
            kind,
            size,
            created,
            asset_date,
            added_date,
            dimensions,
            duration_secs: self.field("duration").as_f64(),
            location,
        })
    }
}

/// Pair the CPLAsset and CPLMaster records of one page. Returns the pairs in
/// listing order and the number of master records seen, which advances the
/// `startRank` of the next page.
pub fn pair_records(records: Vec<Value>) -> (Vec<PhotoRecord>, u64) {
    let mut assets: HashMap<String, Value> = HashMap::new();
    let mut masters: Vec<Value> = Vec::new();
    for rec in records {
        match rec["recordType"].as_str() {
            Some("CPLAsset") => {
                if let Some(master_id) = rec["fields"]["masterRef"]["value"]["recordName"].as_str() {
                    assets.insert(master_id.to_string(), rec);
                }
            }
            Some("CPLMaster") => masters.push(rec),
            _ => {}
        }
    }

    let seen = masters.len() as u64;
    let pairs = masters
        .into_iter()
        .filter_map(|master| {
            let name = master["recordName"].as_str()?.to_string();
            match assets.remove(&name) {
                Some(asset) => Some(PhotoRecord::new(master, asset)),
                None => {
                    tracing::debug!(master = %name, "Master record without asset");
                    None
                }
            }
        })
        .collect();
    (pairs, seen)
}

/// Server error code of the first record in a `records/modify` response.
pub(crate) fn modify_error(response: &QueryResponse) -> Option<&str> {
    response
        .records
        .first()
        .and_then(|r| r["serverErrorCode"].as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master(name: &str, filename: &str) -> Value {
        json!({
            "recordName": name,
            "recordType": "CPLMaster",
            "created": {"timestamp": 1_600_000_000_000i64},
            "fields": {
                "filenameEnc": {"value": filename, "type": "STRING"},
                "itemType": {"value": "public.heic"},
                "resOriginalRes": {"value": {
                    "size": 2048,
                    "downloadURL": "https://cvws.icloud-content.com/B/abc",
                    "fileChecksum": "AbCd"
                }},
                "resOriginalWidth": {"value": 4032},
                "resOriginalHeight": {"value": 3024}
            }
        })
    }

    fn asset(name: &str, master: &str) -> Value {
        json!({
            "recordName": name,
            "recordType": "CPLAsset",
            "recordChangeTag": "tag1",
            "fields": {
                "masterRef": {"value": {"recordName": master}},
                "assetDate": {"value": 1_736_899_200_000i64},
                "addedDate": {"value": 1_736_985_600_000i64},
                "locationLatitude": {"value": 48.85},
                "locationLongitude": {"value": 2.35}
            }
        })
    }

    #[test]
    fn test_pair_records_keeps_master_order() {
        let records = vec![
            asset("A2", "M2"),
            master("M1", "one.heic"),
            asset("A1", "M1"),
            master("M2", "two.heic"),
            master("M3", "orphan.heic"),
        ];
        let (pairs, masters) = pair_records(records);
        assert_eq!(masters, 3);
        let names: Vec<_> = pairs.iter().map(|p| p.record_name().unwrap()).collect();
        assert_eq!(names, vec!["A1", "A2"]);
    }

    #[test]
    fn test_describe_decodes_fields() {
        let rec = PhotoRecord::new(master("M1", "IMG_0001.HEIC"), asset("A1", "M1"));
        let a = rec.describe().unwrap();
        assert_eq!(a.id, "A1");
        assert_eq!(a.filename, "IMG_0001.HEIC");
        assert_eq!(a.kind, AssetKind::Image);
        assert_eq!(a.size, 2048);
        assert_eq!(a.dimensions, Some((4032, 3024)));
        assert_eq!(a.asset_date.unwrap().format("%Y-%m-%d").to_string(), "2025-01-15");
        assert_eq!(a.added_date.unwrap().format("%Y-%m-%d").to_string(), "2025-01-16");
        assert_eq!(a.created.unwrap().format("%Y").to_string(), "2020");
        assert_eq!(a.location.unwrap().latitude, 48.85);
        assert_eq!(rec.change_tag(), Some("tag1"));
    }

    #[test]
    fn test_created_falls_back_to_asset_date() {
        let mut m = master("M1", "a.heic");
        m.as_object_mut().unwrap().remove("created");
        let a = PhotoRecord::new(m, asset("A1", "M1")).describe().unwrap();
        assert_eq!(a.created, a.asset_date);
    }

    #[test]
    fn test_encrypted_filename() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"clip.MOV");
        let mut m = master("M1", "x");
        m["fields"]["filenameEnc"] = json!({"value": encoded, "type": "ENCRYPTED_BYTES"});
        m["fields"]["itemType"] = json!({"value": "unknown.type"});
        let a = PhotoRecord::new(m, asset("A1", "M1")).describe().unwrap();
        assert_eq!(a.filename, "clip.MOV");
        assert_eq!(a.kind, AssetKind::Video);
    }

    #[test]
    fn test_missing_filename_is_field_error() {
        let mut m = master("M1", "x");
        m["fields"].as_object_mut().unwrap().remove("filenameEnc");
        let err = PhotoRecord::new(m, asset("A1", "M1")).describe().unwrap_err();
        assert!(matches!(err, FieldError::Missing("filenameEnc")));
    }

    #[test]
    fn test_original_resource() {
        let rec = PhotoRecord::new(master("M1", "a.heic"), asset("A1", "M1"));
        let res = rec.original().unwrap();
        assert_eq!(res.size, 2048);
        assert_eq!(res.checksum.as_deref(), Some("AbCd"));
    }

    #[test]
    fn test_list_query_is_descending() {
        let q = list_query(200, 100);
        assert_eq!(q["query"]["filterBy"][0]["fieldValue"]["value"], 200);
        assert_eq!(q["query"]["filterBy"][1]["fieldValue"]["value"], "DESCENDING");
        assert_eq!(q["resultsLimit"], 200);
        assert_eq!(q["query"]["recordType"], LIST_TYPE);
    }

    #[test]
    fn test_delete_operation_and_error() {
        let op = delete_operation("A1", Some("tag1"));
        assert_eq!(op["operations"][0]["record"]["fields"]["isDeleted"]["value"], 1);
        let resp: QueryResponse = serde_json::from_value(json!({
            "records": [{"recordName": "A1", "serverErrorCode": "NOT_FOUND"}]
        }))
        .unwrap();
        assert_eq!(modify_error(&resp), Some("NOT_FOUND"));
    }

    #[test]
    fn test_encode_params_sorted() {
        let mut params = HashMap::new();
        params.insert("b".to_string(), Value::Bool(true));
        params.insert("a".to_string(), Value::from("x y"));
        assert_eq!(encode_params(&params), "a=x%20y&b=true");
    }
}
