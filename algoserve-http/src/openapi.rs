//! OpenAPI document generation and the Swagger UI shell.
//!
//! Builds a compact OpenAPI 3.1 document from the registered specs — one
//! execute path per algorithm with its input/output schemas promoted into
//! `components/schemas` — plus the catalog and probe routes. `/docs` serves
//! a CDN-backed Swagger UI pointing at `/openapi.json` when enabled.

use serde_json::{json, Map, Value};

use algoserve_core::registry::AlgorithmRegistry;

/// Rewrite `$ref` paths from schemars format to OpenAPI components format.
///
/// schemars emits JSON Schema Draft 2020-12 with `$defs` and
/// `$ref: "#/$defs/X"`; OpenAPI wants schemas under
/// `#/components/schemas/X`.
fn sanitize_schema(value: &mut Value) {
    match value {
        Value::Object(obj) => {
            if let Some(Value::String(ref_str)) = obj.get_mut("$ref") {
                if ref_str.starts_with("#/$defs/") {
                    *ref_str = ref_str.replace("#/$defs/", "#/components/schemas/");
                }
            }
            for (_, v) in obj.iter_mut() {
                sanitize_schema(v);
            }
        }
        Value::Array(arr) => {
            for v in arr.iter_mut() {
                sanitize_schema(v);
            }
        }
        _ => {}
    }
}

/// Insert a model schema, promoting its `$defs` to top-level components.
fn insert_schema(schemas: &mut Map<String, Value>, type_name: &str, root_schema: Value) {
    let mut schema = root_schema;
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("$schema");
        if let Some(Value::Object(defs)) = obj.remove("$defs") {
            for (def_name, mut def_schema) in defs {
                sanitize_schema(&mut def_schema);
                schemas.insert(def_name, def_schema);
            }
        }
    }
    sanitize_schema(&mut schema);
    schemas.insert(type_name.to_string(), schema);
}

fn envelope_schema(data_ref: &str) -> Value {
    json!({
        "type": "object",
        "required": ["requestId", "datetime", "data"],
        "properties": {
            "requestId": { "type": "string", "minLength": 1 },
            "datetime": { "type": "string", "format": "date-time" },
            "data": { "$ref": data_ref },
            "hyperParams": { "type": "object" },
            "context": { "$ref": "#/components/schemas/AlgorithmContext" },
        },
        "additionalProperties": false,
    })
}

fn response_schema(data_ref: &str) -> Value {
    json!({
        "type": "object",
        "required": ["code", "message", "requestId", "datetime"],
        "properties": {
            "code": { "type": "integer" },
            "message": { "type": "string" },
            "requestId": { "type": "string" },
            "datetime": { "type": "string", "format": "date-time" },
            "context": { "$ref": "#/components/schemas/AlgorithmContext" },
            "data": {
                "oneOf": [{ "$ref": data_ref }, { "type": "null" }],
            },
        },
    })
}

/// Build the OpenAPI document for the current registry.
pub fn build_document(registry: &AlgorithmRegistry) -> Value {
    let mut paths = Map::new();
    let mut schemas = Map::new();

    schemas.insert(
        "AlgorithmContext".to_string(),
        json!({
            "type": "object",
            "properties": {
                "traceId": { "type": "string" },
                "tenantId": { "type": "string" },
                "userId": { "type": "string" },
                "extra": { "type": "object" },
            },
        }),
    );

    for spec in registry.list() {
        let input_name = format!("{}_{}_{}", spec.name, spec.version, spec.input_model.name());
        let output_name = format!("{}_{}_{}", spec.name, spec.version, spec.output_model.name());
        insert_schema(&mut schemas, &input_name, spec.input_model.schema());
        insert_schema(&mut schemas, &output_name, spec.output_model.schema());

        let path = format!("/algorithms/{}/{}", spec.name, spec.version);
        paths.insert(
            path,
            json!({
                "post": {
                    "summary": spec.description.clone()
                        .unwrap_or_else(|| format!("Execute {}@{}", spec.name, spec.version)),
                    "tags": [spec.category],
                    "requestBody": {
                        "required": true,
                        "content": {
                            "application/json": {
                                "schema": envelope_schema(
                                    &format!("#/components/schemas/{input_name}")
                                ),
                            },
                        },
                    },
                    "responses": {
                        "200": {
                            "description": "Business outcome; inspect the body code",
                            "content": {
                                "application/json": {
                                    "schema": response_schema(
                                        &format!("#/components/schemas/{output_name}")
                                    ),
                                },
                            },
                        },
                    },
                },
            }),
        );
    }

    paths.insert(
        "/algorithms".to_string(),
        json!({
            "get": {
                "summary": "Enumerate registered algorithms",
                "responses": { "200": { "description": "Spec summaries" } },
            },
        }),
    );
    paths.insert(
        "/healthz".to_string(),
        json!({
            "get": {
                "summary": "Liveness probe",
                "responses": { "200": { "description": "Process is responsive" } },
            },
        }),
    );
    paths.insert(
        "/readyz".to_string(),
        json!({
            "get": {
                "summary": "Readiness probe",
                "responses": {
                    "200": { "description": "Ready" },
                    "503": { "description": "Not ready, with check breakdown" },
                },
            },
        }),
    );

    json!({
        "openapi": "3.1.0",
        "info": {
            "title": "Algoserve",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Algorithm execution server",
        },
        "paths": paths,
        "components": { "schemas": schemas },
    })
}

/// The Swagger UI shell served at the docs path.
pub fn swagger_ui_html() -> String {
    r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <title>Algoserve API</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use algoserve_core::def::AlgorithmDef;
    use algoserve_core::spec::RunError;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, schemars::JsonSchema)]
    struct In {
        value: i64,
    }

    #[derive(Serialize, Deserialize, schemars::JsonSchema)]
    struct Out {
        doubled: i64,
    }

    #[test]
    fn document_lists_algorithm_paths_and_schemas() {
        let mut registry = AlgorithmRegistry::new();
        registry
            .register(
                AlgorithmDef::function("double", "v1", |inp: In| {
                    Ok::<_, RunError>(Out {
                        doubled: inp.value * 2,
                    })
                })
                .author("tests")
                .category("arithmetic")
                .created("2026-01-01"),
            )
            .unwrap();

        let doc = build_document(&registry);
        assert_eq!(doc["openapi"], "3.1.0");
        assert!(doc["paths"]["/algorithms/double/v1"]["post"].is_object());
        assert!(doc["components"]["schemas"]["double_v1_In"].is_object());
        assert!(doc["components"]["schemas"]["double_v1_Out"]["properties"]["doubled"].is_object());
        assert!(doc["paths"]["/readyz"]["get"].is_object());
    }

    #[test]
    fn dollar_refs_are_rewritten_for_components() {
        let mut value = json!({
            "properties": { "nested": { "$ref": "#/$defs/Inner" } },
            "$defs": {},
        });
        sanitize_schema(&mut value);
        assert_eq!(
            value["properties"]["nested"]["$ref"],
            "#/components/schemas/Inner"
        );
    }
}
