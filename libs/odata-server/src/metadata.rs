//! Service document and CSDL `$metadata` generated from the registry.

use std::io::Cursor;

use odata_db::EntityType;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use serde_json::{Value as Json, json};

use crate::error::ServiceError;
use crate::service::EntityService;

const EDMX_NS: &str = "http://docs.oasis-open.org/odata/ns/edmx";
const EDM_NS: &str = "http://docs.oasis-open.org/odata/ns/edm";

/// `GET <root>/`: one entry per exposed entity set.
#[must_use]
pub fn service_document(service: &EntityService, root: &str) -> Json {
    let value: Vec<Json> = service
        .exposed()
        .map(|(entity, _)| {
            json!({
                "name": entity.set_name,
                "kind": "EntitySet",
                "url": entity.set_name,
            })
        })
        .collect();
    json!({
        "@odata.context": format!("{root}/$metadata"),
        "value": value,
    })
}

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn empty(w: &mut XmlWriter, name: &str, attrs: &[(&str, &str)]) -> std::io::Result<()> {
    let mut el = BytesStart::new(name);
    for &attr in attrs {
        el.push_attribute(attr);
    }
    w.write_event(Event::Empty(el))
}

fn start(w: &mut XmlWriter, name: &str, attrs: &[(&str, &str)]) -> std::io::Result<()> {
    let mut el = BytesStart::new(name);
    for &attr in attrs {
        el.push_attribute(attr);
    }
    w.write_event(Event::Start(el))
}

fn end(w: &mut XmlWriter, name: &str) -> std::io::Result<()> {
    w.write_event(Event::End(BytesEnd::new(name)))
}

fn write_entity_type(
    w: &mut XmlWriter,
    entity: &EntityType,
    namespace: &str,
) -> std::io::Result<()> {
    start(w, "EntityType", &[("Name", entity.name.as_str())])?;
    start(w, "Key", &[])?;
    empty(w, "PropertyRef", &[("Name", entity.key.as_str())])?;
    end(w, "Key")?;

    for prop in &entity.properties {
        let mut attrs = vec![("Name", prop.name.as_str()), ("Type", prop.kind.edm_type())];
        if !prop.nullable {
            attrs.push(("Nullable", "false"));
        }
        empty(w, "Property", &attrs)?;
    }

    for nav in &entity.navigations {
        let target = format!("{namespace}.{}", nav.target);
        let ty = if nav.kind.is_collection() {
            format!("Collection({target})")
        } else {
            target
        };
        empty(w, "NavigationProperty", &[("Name", nav.name.as_str()), ("Type", ty.as_str())])?;
    }

    end(w, "EntityType")
}

fn write_document(service: &EntityService, namespace: &str) -> std::io::Result<Vec<u8>> {
    let mut w = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    start(&mut w, "edmx:Edmx", &[("Version", "4.0"), ("xmlns:edmx", EDMX_NS)])?;
    start(&mut w, "edmx:DataServices", &[])?;
    start(&mut w, "Schema", &[("Namespace", namespace), ("xmlns", EDM_NS)])?;

    for entity in service.registry().iter() {
        write_entity_type(&mut w, entity, namespace)?;
    }

    for (entity, controller) in service.exposed() {
        let binding = format!("Collection({namespace}.{})", entity.name);
        for (name, is_function) in controller.actions() {
            let element = if is_function { "Function" } else { "Action" };
            start(&mut w, element, &[("Name", name), ("IsBound", "true")])?;
            empty(
                &mut w,
                "Parameter",
                &[("Name", "bindingParameter"), ("Type", binding.as_str())],
            )?;
            empty(&mut w, "ReturnType", &[("Type", "Edm.Untyped")])?;
            end(&mut w, element)?;
        }
    }

    start(&mut w, "EntityContainer", &[("Name", "Container")])?;
    for (entity, _) in service.exposed() {
        let ty = format!("{namespace}.{}", entity.name);
        start(
            &mut w,
            "EntitySet",
            &[("Name", entity.set_name.as_str()), ("EntityType", ty.as_str())],
        )?;
        for nav in &entity.navigations {
            let Some(target) = service.registry().by_name(&nav.target) else {
                continue;
            };
            if service.resolve_set(&target.set_name).is_ok() {
                empty(
                    &mut w,
                    "NavigationPropertyBinding",
                    &[("Path", nav.name.as_str()), ("Target", target.set_name.as_str())],
                )?;
            }
        }
        end(&mut w, "EntitySet")?;
    }
    end(&mut w, "EntityContainer")?;

    end(&mut w, "Schema")?;
    end(&mut w, "edmx:DataServices")?;
    end(&mut w, "edmx:Edmx")?;
    Ok(w.into_inner().into_inner())
}

/// CSDL XML describing every registered type and the exposed sets.
///
/// # Errors
/// `ServerInternal` if the document cannot be written.
pub fn csdl(service: &EntityService, namespace: &str) -> Result<String, ServiceError> {
    let bytes = write_document(service, namespace)
        .map_err(|e| ServiceError::internal(format!("writing $metadata: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| ServiceError::internal(format!("writing $metadata: {e}")))
}
