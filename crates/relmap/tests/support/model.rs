//! Entities shared by the integration tests.

use std::sync::Arc;

use relmap::{DescriptorBuilder, DescriptorRegistry, Entity, RegistryBuilder, SqlType};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Department {
    pub id: i64,
    pub name: String,
}

impl Entity for Department {
    const ENTITY_NAME: &'static str = "Department";

    fn descriptor() -> DescriptorBuilder<Self> {
        DescriptorBuilder::<Self>::new("DEPARTMENT")
            .field("id", "DEPT_ID", SqlType::BigInt, |d| d.id.into(), |d, v| {
                d.id = v.try_into()?;
                Ok(())
            })
            .field("name", "NAME", SqlType::VarChar(40), |d| d.name.clone().into(), |d, v| {
                d.name = v.try_into()?;
                Ok(())
            })
            .not_null()
            .primary_key(&["id"])
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Employee {
    pub id: Option<i64>,
    pub name: String,
    pub salary: Option<i64>,
    pub dept: Option<i64>,
}

impl Employee {
    pub fn new(name: &str, salary: i64) -> Self {
        Self {
            name: name.to_string(),
            salary: Some(salary),
            ..Self::default()
        }
    }
}

impl Entity for Employee {
    const ENTITY_NAME: &'static str = "Employee";

    fn descriptor() -> DescriptorBuilder<Self> {
        DescriptorBuilder::<Self>::new("EMPLOYEE")
            .field("id", "EMP_ID", SqlType::BigInt, |e| e.id.into(), |e, v| {
                e.id = v.try_into()?;
                Ok(())
            })
            .field("name", "NAME", SqlType::VarChar(40), |e| e.name.clone().into(), |e, v| {
                e.name = v.try_into()?;
                Ok(())
            })
            .not_null()
            .field("salary", "SALARY", SqlType::BigInt, |e| e.salary.into(), |e, v| {
                e.salary = v.try_into()?;
                Ok(())
            })
            .reference("dept", "DEPT_ID", SqlType::BigInt, "Department", |e| e.dept.into(), |e, v| {
                e.dept = v.try_into()?;
                Ok(())
            })
            .primary_key(&["id"])
            .generated_key()
    }
}

/// Single-table inheritance: `VEH_TYPE` picks the variant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vehicle {
    pub id: i64,
    pub kind: String,
    pub capacity: i64,
    pub fuel: Option<String>,
    pub payload: Option<i64>,
}

impl Vehicle {
    pub fn car() -> Self {
        Self {
            kind: "C".to_string(),
            ..Self::default()
        }
    }

    pub fn truck() -> Self {
        Self {
            kind: "T".to_string(),
            ..Self::default()
        }
    }
}

impl Entity for Vehicle {
    const ENTITY_NAME: &'static str = "Vehicle";

    fn descriptor() -> DescriptorBuilder<Self> {
        DescriptorBuilder::<Self>::new("VEHICLE")
            .field("id", "ID", SqlType::BigInt, |v| v.id.into(), |v, x| {
                v.id = x.try_into()?;
                Ok(())
            })
            .field("kind", "VEH_TYPE", SqlType::Char(1), |v| v.kind.clone().into(), |v, x| {
                v.kind = x.try_into()?;
                Ok(())
            })
            .not_null()
            .field("capacity", "CAPACITY", SqlType::BigInt, |v| v.capacity.into(), |v, x| {
                v.capacity = x.try_into()?;
                Ok(())
            })
            .field("fuel", "FUEL_TYP", SqlType::VarChar(20), |v| v.fuel.clone().into(), |v, x| {
                v.fuel = x.try_into()?;
                Ok(())
            })
            .field("payload", "PAYLOAD", SqlType::BigInt, |v| v.payload.into(), |v, x| {
                v.payload = x.try_into()?;
                Ok(())
            })
            .primary_key(&["id"])
            .discriminator("kind")
            .variant("Car", "C", Vehicle::car, &["fuel"])
            .variant("Truck", "T", Vehicle::truck, &["payload"])
    }
}

pub fn registry() -> Arc<DescriptorRegistry> {
    RegistryBuilder::new()
        .register::<Employee>()
        .register::<Department>()
        .register::<Vehicle>()
        .seal()
        .expect("seal test registry")
}
